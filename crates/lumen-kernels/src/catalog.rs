//! The native kernel catalog.
//!
//! Device code is addressed by `(module, entry)`. The `"activation"` module
//! exposes four entries per activation kind `k`:
//!
//! | entry                   | layout                         | parameters                                   |
//! |-------------------------|--------------------------------|----------------------------------------------|
//! | `k`                     | flat, `size` elements          | `data, n, param`                             |
//! | `multi_k`               | pitched rows                   | `data, width, pitch_bytes, param`            |
//! | `k_conditional`         | `count` stacked masked problems| `data, mask, n, param`                       |
//! | `multi_k_conditional`   | pitched rows, dense mask       | `data, mask, width, pitch_bytes, param`      |
//!
//! `param` is the leak coefficient for `leaky_relu` and ignored elsewhere.
//! The softmax entries are row reductions: one block per row, see
//! [`crate::geometry::plan_rows`].

use lumen_common::{KernelError, Result};

use crate::activation::scalar;

/// Name of the activation module.
pub const ACTIVATION: &str = "activation";

/// A compilable unit of device code and the entry points it exports.
#[derive(Debug)]
pub struct KernelModule {
    pub name: &'static str,
    /// CUDA C source, compiled with NVRTC on first use per device.
    pub source: &'static str,
    pub entries: &'static [KernelEntry],
}

impl KernelModule {
    pub fn entry(&self, name: &str) -> Option<&'static KernelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct KernelEntry {
    pub name: &'static str,
    pub op: KernelOp,
    pub layout: Layout,
}

/// The per-element (or per-row) operation an entry performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelOp {
    Identity,
    Sigmoid,
    Tanh,
    ReLU,
    LeakyReLU,
    SoftMax,
}

impl KernelOp {
    /// Evaluate one element. `param` is the leak coefficient.
    #[inline]
    pub fn apply(self, x: f32, param: f32) -> f32 {
        match self {
            Self::Identity => x,
            Self::Sigmoid => scalar::sigmoid(x),
            Self::Tanh => scalar::tanh_act(x),
            Self::ReLU => scalar::relu(x),
            Self::LeakyReLU => scalar::leaky_relu(x, param),
            // Singleton row: normalises to exactly one element.
            Self::SoftMax => {
                let mut v = x;
                scalar::softmax(&mut [&mut v]);
                v
            }
        }
    }

    /// Row reductions need a whole row per block.
    pub fn is_row_reduction(self) -> bool {
        matches!(self, Self::SoftMax)
    }
}

/// How an entry addresses its data (and mask).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Flat,
    Pitched,
    Stacked,
    PitchedMasked,
}

impl Layout {
    pub fn is_masked(self) -> bool {
        matches!(self, Self::Stacked | Self::PitchedMasked)
    }

    pub fn is_pitched(self) -> bool {
        matches!(self, Self::Pitched | Self::PitchedMasked)
    }
}

macro_rules! activation_entries {
    ($($op:ident => [$flat:literal, $pitched:literal, $stacked:literal, $masked:literal $(,)?]),* $(,)?) => {
        &[$(
            KernelEntry { name: $flat, op: KernelOp::$op, layout: Layout::Flat },
            KernelEntry { name: $pitched, op: KernelOp::$op, layout: Layout::Pitched },
            KernelEntry { name: $stacked, op: KernelOp::$op, layout: Layout::Stacked },
            KernelEntry { name: $masked, op: KernelOp::$op, layout: Layout::PitchedMasked },
        )*]
    };
}

pub static ACTIVATION_MODULE: KernelModule = KernelModule {
    name: ACTIVATION,
    source: include_str!("kernels/activation.cu"),
    entries: activation_entries![
        Identity => ["identity", "multi_identity", "identity_conditional", "multi_identity_conditional"],
        Sigmoid => ["sigmoid", "multi_sigmoid", "sigmoid_conditional", "multi_sigmoid_conditional"],
        Tanh => ["tanh_act", "multi_tanh_act", "tanh_act_conditional", "multi_tanh_act_conditional"],
        ReLU => ["relu", "multi_relu", "relu_conditional", "multi_relu_conditional"],
        LeakyReLU => [
            "leaky_relu",
            "multi_leaky_relu",
            "leaky_relu_conditional",
            "multi_leaky_relu_conditional",
        ],
        SoftMax => ["softmax", "multi_softmax", "softmax_conditional", "multi_softmax_conditional"],
    ],
};

static MODULES: &[&KernelModule] = &[&ACTIVATION_MODULE];

/// Look up a module by name.
pub fn module(name: &str) -> Result<&'static KernelModule> {
    MODULES.iter().copied().find(|m| m.name == name).ok_or_else(|| {
        KernelError::KernelLoadFailure {
            module: name.to_string(),
            entry: String::new(),
            reason: "no such module in the kernel catalog".to_string(),
        }
        .into()
    })
}

/// Look up `entry` within `module`.
pub fn entry(module_name: &str, entry: &str) -> Result<(&'static KernelModule, &'static KernelEntry)> {
    let m = module(module_name)?;
    let e = m.entry(entry).ok_or_else(|| KernelError::KernelLoadFailure {
        module: module_name.to_string(),
        entry: entry.to_string(),
        reason: "no such entry in module".to_string(),
    })?;
    Ok((m, e))
}

/// Entry name of the activation kernel for `op` with `layout`.
pub fn entry_for(op: KernelOp, layout: Layout) -> &'static str {
    ACTIVATION_MODULE
        .entries
        .iter()
        .find(|e| e.op == op && e.layout == layout)
        .map(|e| e.name)
        // every (op, layout) pair is listed above
        .unwrap_or_default()
}
