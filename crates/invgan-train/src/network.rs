//! The three function approximators.
//!
//! One [`Network`] type covers all three roles. Each instance owns its own
//! [`nn::VarStore`], so gradients and optimizer updates can never leak across
//! networks. Images cross the public API as `[B, H, W, C]` in `[-1, 1]` and
//! are permuted to channels-first internally.
//!
//! Topologies (`w` = base width, `s` = image size):
//!
//! * Generator: `Dense(z -> (s/32)^2 * 48w)` → BN → ReLU → reshape →
//!   `ConvT(5, /2, 12w)` → BN → ReLU → `ConvT(9, /4, 24)` → tanh →
//!   `ConvT(9, /4, 3)` → tanh
//! * Critic: three `Conv(5, /2)` of width `w, 2w, 4w` with LeakyReLU(0.3),
//!   then `Dense(1)`
//! * Inverter: the critic trunk, then `Dense(8w)` → `Dense(z)`

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tch::nn::{self, ModuleT};
use tch::{Device, Tensor};

use crate::error::{TrainError, TrainResult};

/// Running-average momentum of batch normalization (Keras 0.99 decay)
const BN_MOMENTUM: f64 = 0.01;
const BN_EPSILON: f64 = 1e-3;
const LEAKY_SLOPE: f64 = 0.3;

/// Channels of the generator's penultimate transposed convolution
const GENERATOR_PRE_OUTPUT_CHANNELS: i64 = 24;

/// Which of the three networks an instance plays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Generator,
    Critic,
    Inverter,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Generator, Role::Critic, Role::Inverter];

    pub fn name(self) -> &'static str {
        match self {
            Role::Generator => "generator",
            Role::Critic => "critic",
            Role::Inverter => "inverter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Forward-pass mode; only batch normalization behaves differently
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Batch statistics are used and running statistics updated
    Train,
    /// Frozen running statistics are used
    Infer,
}

impl Mode {
    pub fn is_train(self) -> bool {
        self == Mode::Train
    }
}

/// Shape hyper-parameters shared by all three networks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    pub z_dim: usize,
    pub image_size: usize,
    pub base_width: usize,
}

impl Architecture {
    /// `[batch, H, W, C]`
    pub fn image_dims(&self, batch: i64) -> Vec<i64> {
        let s = self.image_size as i64;
        vec![batch, s, s, 3]
    }

    /// `[batch, z]`
    pub fn noise_dims(&self, batch: i64) -> Vec<i64> {
        vec![batch, self.z_dim as i64]
    }

    /// Feature count after the convolutional trunk
    fn trunk_features(&self) -> i64 {
        let side = (self.image_size / 8) as i64;
        4 * self.base_width as i64 * side * side
    }
}

/// One trainable tensor or buffer in a description
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    pub shape: Vec<i64>,
    pub trainable: bool,
}

/// Serializable topology of a network, written next to exported weights
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkDescription {
    pub role: Role,
    pub architecture: Architecture,
    pub input_shape: Vec<i64>,
    pub output_shape: Vec<i64>,
    pub layers: Vec<String>,
    pub parameters: Vec<ParameterInfo>,
    pub num_parameters: usize,
}

/// Files written by [`Network::export`]
#[derive(Clone, Debug)]
pub struct ExportedModel {
    pub weights: PathBuf,
    pub description: PathBuf,
}

/// A generator, critic or inverter with its own variable store
pub struct Network {
    role: Role,
    arch: Architecture,
    vs: nn::VarStore,
    body: nn::SequentialT,
    layers: Vec<String>,
}

impl Network {
    /// Build a freshly initialised network on `device`.
    ///
    /// Initial values come from libtorch's global generator; seed it with
    /// `tch::manual_seed` first for reproducible weights.
    pub fn new(role: Role, arch: Architecture, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let (body, layers) = match role {
            Role::Generator => generator(&root, &arch),
            Role::Critic => critic(&root, &arch),
            Role::Inverter => inverter(&root, &arch),
        };
        Self { role, arch, vs, body, layers }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Expected input shape for a batch of `batch`
    pub fn input_dims(&self, batch: i64) -> Vec<i64> {
        match self.role {
            Role::Generator => self.arch.noise_dims(batch),
            Role::Critic | Role::Inverter => self.arch.image_dims(batch),
        }
    }

    pub fn output_dims(&self, batch: i64) -> Vec<i64> {
        match self.role {
            Role::Generator => self.arch.image_dims(batch),
            Role::Critic => vec![batch, 1],
            Role::Inverter => self.arch.noise_dims(batch),
        }
    }

    /// Evaluate the network. Gradients are recorded unless the caller is
    /// inside `tch::no_grad`.
    pub fn forward(&self, xs: &Tensor, mode: Mode) -> Tensor {
        self.body.forward_t(xs, mode.is_train())
    }

    /// [`Network::forward`] with an input shape check
    pub fn forward_checked(&self, xs: &Tensor, mode: Mode) -> TrainResult<Tensor> {
        let actual = xs.size();
        let batch = actual.first().copied().unwrap_or(0);
        let expected = self.input_dims(batch);
        if actual != expected {
            return Err(TrainError::ShapeMismatch {
                what: self.role.name(),
                expected,
                actual,
            });
        }
        Ok(self.forward(xs, mode))
    }

    /// Trainable parameters ordered by name
    pub fn parameters(&self) -> Vec<(String, Tensor)> {
        let mut params: Vec<(String, Tensor)> = self
            .vs
            .variables()
            .into_iter()
            .filter(|(_, t)| t.requires_grad())
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|(_, t)| t.numel()).sum()
    }

    /// Gradient of `loss` with respect to this network's parameters only,
    /// in [`Network::parameters`] order. Parameters `loss` does not reach get
    /// zeros. The graph is kept so other networks can differentiate the same
    /// forward passes.
    pub fn gradient(&self, loss: &Tensor) -> TrainResult<Vec<Tensor>> {
        let params = self.parameters();
        let inputs: Vec<&Tensor> = params.iter().map(|(_, t)| t).collect();
        let grads = Tensor::f_run_backward(&[loss], inputs.as_slice(), true, false)?;
        Ok(grads
            .into_iter()
            .zip(&params)
            .map(|(g, (_, p))| if g.defined() { g } else { p.zeros_like() })
            .collect())
    }

    /// Every variable, including batch-norm running statistics, ordered by name
    pub fn state(&self) -> Vec<(String, Tensor)> {
        let mut vars: Vec<(String, Tensor)> = self.vs.variables().into_iter().collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    /// Overwrite every variable from `state`. All names must be present with
    /// matching shapes; nothing is written unless all of them are.
    pub fn load_state(&mut self, state: &HashMap<String, Tensor>) -> TrainResult<()> {
        let vars = self.state();
        for (name, var) in &vars {
            let src = state.get(name).ok_or_else(|| {
                TrainError::restore(self.role.name(), format!("missing tensor `{}`", name))
            })?;
            if src.size() != var.size() {
                return Err(TrainError::ShapeMismatch {
                    what: self.role.name(),
                    expected: var.size(),
                    actual: src.size(),
                });
            }
        }

        tch::no_grad(|| -> TrainResult<()> {
            for (name, var) in &vars {
                if let Some(src) = state.get(name) {
                    let mut dst = var.shallow_clone();
                    dst.f_copy_(src)?;
                }
            }
            Ok(())
        })
    }

    pub fn describe(&self) -> NetworkDescription {
        let parameters: Vec<ParameterInfo> = self
            .state()
            .into_iter()
            .map(|(name, t)| ParameterInfo { name, shape: t.size(), trainable: t.requires_grad() })
            .collect();
        NetworkDescription {
            role: self.role,
            architecture: self.arch,
            input_shape: self.input_dims(-1),
            output_shape: self.output_dims(-1),
            layers: self.layers.clone(),
            parameters,
            num_parameters: self.num_parameters(),
        }
    }

    /// Write `<role>.safetensors` and `<role>.json` into `dir`
    pub fn export(&self, dir: &Path) -> TrainResult<ExportedModel> {
        std::fs::create_dir_all(dir)?;
        let weights = dir.join(format!("{}.safetensors", self.role.name()));
        let description = dir.join(format!("{}.json", self.role.name()));

        self.vs.save(&weights)?;
        let json = serde_json::to_string_pretty(&self.describe())?;
        std::fs::write(&description, json)?;

        tracing::debug!("Exported {} to {:?}", self.role, weights);
        Ok(ExportedModel { weights, description })
    }
}

fn leaky_relu(xs: &Tensor) -> Tensor {
    xs.maximum(&(xs * LEAKY_SLOPE))
}

fn batch_norm_config() -> nn::BatchNormConfig {
    nn::BatchNormConfig { momentum: BN_MOMENTUM, eps: BN_EPSILON, ..Default::default() }
}

/// Transposed convolution that multiplies the spatial size by `stride`
fn upsample_config(stride: i64, padding: i64) -> nn::ConvTransposeConfig {
    nn::ConvTransposeConfig {
        stride,
        padding,
        output_padding: 1,
        bias: false,
        ..Default::default()
    }
}

fn generator(p: &nn::Path, arch: &Architecture) -> (nn::SequentialT, Vec<String>) {
    let w = arch.base_width as i64;
    let side = (arch.image_size / 32) as i64;
    let c0 = 48 * w;
    let c1 = 12 * w;
    let dense = side * side * c0;
    let no_bias = nn::LinearConfig { bias: false, ..Default::default() };

    let seq = nn::seq_t()
        .add(nn::linear(p / "dense", arch.z_dim as i64, dense, no_bias))
        .add(nn::batch_norm1d(p / "dense_bn", dense, batch_norm_config()))
        .add_fn(|xs| xs.relu())
        .add_fn(move |xs| xs.view([-1, c0, side, side]))
        .add(nn::conv_transpose2d(p / "deconv1", c0, c1, 5, upsample_config(2, 2)))
        .add(nn::batch_norm2d(p / "deconv1_bn", c1, batch_norm_config()))
        .add_fn(|xs| xs.relu())
        .add(nn::conv_transpose2d(
            p / "deconv2",
            c1,
            GENERATOR_PRE_OUTPUT_CHANNELS,
            9,
            upsample_config(4, 3),
        ))
        .add_fn(|xs| xs.tanh())
        .add(nn::conv_transpose2d(
            p / "deconv3",
            GENERATOR_PRE_OUTPUT_CHANNELS,
            3,
            9,
            upsample_config(4, 3),
        ))
        .add_fn(|xs| xs.tanh())
        .add_fn(|xs| xs.permute([0, 2, 3, 1]).contiguous());

    let layers = vec![
        format!("dense({} -> {}, no bias)", arch.z_dim, dense),
        "batch_norm".into(),
        "relu".into(),
        format!("reshape({}, {}, {})", c0, side, side),
        format!("conv_transpose(5x5, stride 2, {} -> {}, no bias)", c0, c1),
        "batch_norm".into(),
        "relu".into(),
        format!("conv_transpose(9x9, stride 4, {} -> {}, no bias)", c1, GENERATOR_PRE_OUTPUT_CHANNELS),
        "tanh".into(),
        format!("conv_transpose(9x9, stride 4, {} -> 3, no bias)", GENERATOR_PRE_OUTPUT_CHANNELS),
        "tanh".into(),
    ];
    (seq, layers)
}

/// Strided convolutions shared by the critic and inverter; ends flattened
fn conv_trunk(p: &nn::Path, arch: &Architecture) -> (nn::SequentialT, Vec<String>) {
    let w = arch.base_width as i64;
    let conv = nn::ConvConfig { stride: 2, padding: 2, ..Default::default() };

    let mut seq = nn::seq_t().add_fn(|xs| xs.permute([0, 3, 1, 2]));
    let mut layers = Vec::new();
    let mut in_channels = 3;
    for (i, out_channels) in [w, 2 * w, 4 * w].into_iter().enumerate() {
        seq = seq
            .add(nn::conv2d(p / format!("conv{}", i + 1), in_channels, out_channels, 5, conv))
            .add_fn(leaky_relu);
        layers.push(format!("conv(5x5, stride 2, {} -> {})", in_channels, out_channels));
        layers.push(format!("leaky_relu({})", LEAKY_SLOPE));
        in_channels = out_channels;
    }
    seq = seq.add_fn(|xs| xs.flatten(1, -1));
    layers.push("flatten".into());
    (seq, layers)
}

fn critic(p: &nn::Path, arch: &Architecture) -> (nn::SequentialT, Vec<String>) {
    let (trunk, mut layers) = conv_trunk(p, arch);
    let features = arch.trunk_features();
    let seq = trunk.add(nn::linear(p / "score", features, 1, Default::default()));
    layers.push(format!("dense({} -> 1)", features));
    (seq, layers)
}

fn inverter(p: &nn::Path, arch: &Architecture) -> (nn::SequentialT, Vec<String>) {
    let (trunk, mut layers) = conv_trunk(p, arch);
    let features = arch.trunk_features();
    let hidden = 8 * arch.base_width as i64;
    let seq = trunk
        .add(nn::linear(p / "hidden", features, hidden, Default::default()))
        .add(nn::linear(p / "latent", hidden, arch.z_dim as i64, Default::default()));
    layers.push(format!("dense({} -> {})", features, hidden));
    layers.push(format!("dense({} -> {})", hidden, arch.z_dim));
    (seq, layers)
}
