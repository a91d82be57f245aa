//! Policies that map one agent's observation to an action, including the
//! feed-forward network trained by imitation learning.

use anyhow::{anyhow, Context, Result};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument};

const WEIGHTS_FORMAT_VERSION: u32 = 1;

pub trait Policy {
    /// Action vector for a single observation.
    fn get_action(&mut self, observation: &[f64]) -> Result<Vec<f64>>;

    /// Scalar acceleration for a single observation.
    fn get_accel_from_observation(&mut self, observation: &[f64]) -> Result<f64> {
        match self.get_action(observation)?.as_slice() {
            [accel] => Ok(*accel),
            other => Err(anyhow!("Expected a scalar action, got {} values", other.len())),
        }
    }
}

/// Options for building a fresh network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub hidden_sizes: Vec<usize>,
    pub stochastic: bool,
    pub seed: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hidden_sizes: vec![32, 32],
            stochastic: false,
            seed: None,
        }
    }
}

/// Weights of one dense layer, `weights` laid out as `[output][input]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LayerFile {
    weights: Vec<Vec<f64>>,
    biases: Vec<f64>,
}

/// On-disk format of a saved network.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NetworkFile {
    version: u32,
    obs_dim: usize,
    action_dim: usize,
    hidden: Vec<LayerFile>,
    mean_head: LayerFile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_var_head: Option<LayerFile>,
}

#[derive(Debug, Clone)]
struct Dense {
    weights: Array2<f64>,
    biases: Array1<f64>,
}

impl Dense {
    /// Xavier-initialized layer.
    fn random(input: usize, output: usize, rng: &mut StdRng) -> Result<Self> {
        let std_dev = (2.0 / (input + output) as f64).sqrt();
        let normal = Normal::new(0.0, std_dev)?;
        Ok(Self {
            weights: Array2::from_shape_fn((output, input), |_| normal.sample(&mut *rng)),
            biases: Array1::zeros(output),
        })
    }

    fn from_file(layer: LayerFile, input: usize, name: &str) -> Result<Self> {
        let output = layer.biases.len();
        if layer.weights.len() != output {
            return Err(anyhow!(
                "Layer '{}' has {} weight rows but {} biases",
                name,
                layer.weights.len(),
                output
            ));
        }
        if let Some(row) = layer.weights.iter().find(|row| row.len() != input) {
            return Err(anyhow!(
                "Layer '{}' expects {} inputs but a weight row has {}",
                name,
                input,
                row.len()
            ));
        }
        let flat: Vec<f64> = layer.weights.into_iter().flatten().collect();
        Ok(Self {
            weights: Array2::from_shape_vec((output, input), flat)?,
            biases: Array1::from(layer.biases),
        })
    }

    fn to_file(&self) -> LayerFile {
        LayerFile {
            weights: self.weights.rows().into_iter().map(|r| r.to_vec()).collect(),
            biases: self.biases.to_vec(),
        }
    }

    fn output_size(&self) -> usize {
        self.biases.len()
    }

    fn forward(&self, input: &Array1<f64>) -> Array1<f64> {
        self.weights.dot(input) + &self.biases
    }
}

/// Feed-forward policy network trained to imitate an expert controller.
///
/// Hidden layers use ReLU and the heads are linear. A stochastic network has
/// a log-variance head next to the mean head and samples its actions from
/// `N(mean, exp(log_var))`; otherwise the mean is the action.
#[derive(Debug, Clone)]
pub struct ImitatingNetwork {
    obs_dim: usize,
    action_dim: usize,
    hidden: Vec<Dense>,
    mean_head: Dense,
    log_var_head: Option<Dense>,
    stochastic: bool,
    rng: StdRng,
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

impl ImitatingNetwork {
    /// Build a randomly initialized network.
    pub fn new(action_dim: usize, obs_dim: usize, config: &NetworkConfig) -> Result<Self> {
        if action_dim == 0 || obs_dim == 0 {
            return Err(anyhow!("Observation and action dimensions must be positive"));
        }
        let mut rng = rng_from(config.seed);

        let mut hidden = Vec::with_capacity(config.hidden_sizes.len());
        let mut input = obs_dim;
        for &size in &config.hidden_sizes {
            if size == 0 {
                return Err(anyhow!("Hidden layer sizes must be positive"));
            }
            hidden.push(Dense::random(input, size, &mut rng)?);
            input = size;
        }
        let mean_head = Dense::random(input, action_dim, &mut rng)?;
        let log_var_head = if config.stochastic {
            Some(Dense::random(input, action_dim, &mut rng)?)
        } else {
            None
        };

        Ok(Self {
            obs_dim,
            action_dim,
            hidden,
            mean_head,
            log_var_head,
            stochastic: config.stochastic,
            rng,
        })
    }

    /// Load a network saved with [`ImitatingNetwork::save`].
    #[instrument]
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy weights: {:?}", path))?;
        let file: NetworkFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse policy weights: {:?}", path))?;

        if file.version != WEIGHTS_FORMAT_VERSION {
            return Err(anyhow!(
                "Unsupported weights format version {} (expected {})",
                file.version,
                WEIGHTS_FORMAT_VERSION
            ));
        }
        if file.obs_dim == 0 || file.action_dim == 0 {
            return Err(anyhow!("Observation and action dimensions must be positive"));
        }

        let mut hidden = Vec::with_capacity(file.hidden.len());
        let mut input = file.obs_dim;
        for (i, layer) in file.hidden.into_iter().enumerate() {
            let dense = Dense::from_file(layer, input, &format!("hidden_{}", i))?;
            input = dense.output_size();
            hidden.push(dense);
        }
        let mean_head = Dense::from_file(file.mean_head, input, "mean_head")?;
        let log_var_head = file
            .log_var_head
            .map(|layer| Dense::from_file(layer, input, "log_var_head"))
            .transpose()?;

        for head in std::iter::once(&mean_head).chain(log_var_head.as_ref()) {
            if head.output_size() != file.action_dim {
                return Err(anyhow!(
                    "Network head has {} outputs but action_dim is {}",
                    head.output_size(),
                    file.action_dim
                ));
            }
        }

        info!(
            obs_dim = file.obs_dim,
            action_dim = file.action_dim,
            hidden_layers = hidden.len(),
            stochastic = log_var_head.is_some(),
            "Policy network loaded from {:?}",
            path
        );

        Ok(Self {
            obs_dim: file.obs_dim,
            action_dim: file.action_dim,
            hidden,
            mean_head,
            stochastic: log_var_head.is_some(),
            log_var_head,
            rng: StdRng::from_entropy(),
        })
    }

    /// Choose between sampling and the mean action.
    ///
    /// Sampling needs a log-variance head, so asking a deterministic network
    /// to sample is an error.
    pub fn with_stochastic(mut self, stochastic: bool) -> Result<Self> {
        if stochastic && self.log_var_head.is_none() {
            return Err(anyhow!("Network has no variance head and cannot sample actions"));
        }
        self.stochastic = stochastic;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = NetworkFile {
            version: WEIGHTS_FORMAT_VERSION,
            obs_dim: self.obs_dim,
            action_dim: self.action_dim,
            hidden: self.hidden.iter().map(Dense::to_file).collect(),
            mean_head: self.mean_head.to_file(),
            log_var_head: self.log_var_head.as_ref().map(Dense::to_file),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(&file).context("Failed to serialize policy weights")?;
        fs::write(path, json).with_context(|| format!("Failed to write policy weights: {:?}", path))?;
        info!("Policy network saved to {:?}", path);
        Ok(())
    }

    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    pub fn is_stochastic(&self) -> bool {
        self.stochastic
    }

    /// Mean and (when present) log-variance outputs for one observation.
    pub fn forward(&self, observation: &[f64]) -> Result<(Array1<f64>, Option<Array1<f64>>)> {
        if observation.len() != self.obs_dim {
            return Err(anyhow!(
                "Observation has {} values but the network expects {}",
                observation.len(),
                self.obs_dim
            ));
        }
        if observation.iter().any(|x| !x.is_finite()) {
            return Err(anyhow!("Observation contains non-finite values"));
        }

        let mut x = Array1::from(observation.to_vec());
        for layer in &self.hidden {
            x = layer.forward(&x).mapv(|v| v.max(0.0));
        }
        let mean = self.mean_head.forward(&x);
        let log_var = self.log_var_head.as_ref().map(|head| head.forward(&x));
        Ok((mean, log_var))
    }
}

impl Policy for ImitatingNetwork {
    fn get_action(&mut self, observation: &[f64]) -> Result<Vec<f64>> {
        let (mean, log_var) = self.forward(observation)?;
        let action = match (self.stochastic, log_var) {
            (true, Some(log_var)) => mean
                .iter()
                .zip(log_var.iter())
                .map(|(&m, &lv)| {
                    let normal = Normal::new(m, (0.5 * lv).exp())
                        .map_err(|e| anyhow!("Invalid action distribution: {}", e))?;
                    Ok(normal.sample(&mut self.rng))
                })
                .collect::<Result<Vec<f64>>>()?,
            _ => mean.to_vec(),
        };
        debug!(?observation, ?action, "policy action");
        Ok(action)
    }
}
