//! Core simulation primitives and traits.
//!
//! - [`bus`]: split-transaction request/response types and byte-lane masks
//! - [`serial`]: SPI-style shift engine and 8-N-1 frame engines
//! - [`logging`]: category/level gated logging shared by every component

pub mod bus;
pub mod logging;
pub mod serial;

use serde_json::Value;

/// A component advanced by a pure next-state function.
///
/// `step` reads only `self` (the state before the tick) and the tick's
/// inputs, and returns the state after the tick together with the outputs
/// produced during it. The scheduler computes every component's step from
/// one snapshot before committing any of them.
pub trait Clocked: Sized {
    type Inputs;
    type Outputs;

    fn step(&self, inputs: &Self::Inputs) -> (Self, Self::Outputs);
}

/// Description of a mount point (media slot) that a system supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPointInfo {
    /// Unique identifier for this mount point (e.g., "Memory")
    pub id: String,
    /// User-friendly name for display
    pub name: String,
    /// File extensions accepted by this mount point
    pub extensions: Vec<String>,
    /// Whether this mount point is required for the system to function
    pub required: bool,
}

/// A high-level System trait tying components together.
pub trait System {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Global synchronous reset
    fn reset(&mut self);

    /// Advance `cycles` core clock ticks with no CPU bus traffic.
    fn run_cycles(&mut self, cycles: u64) -> Result<(), Self::Error>;

    /// Return a JSON-serializable save state.
    /// Note: memory images are not part of the state, only component state.
    fn save_state(&self) -> Value;

    /// Load a JSON save state.
    fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error>;

    /// Check if this system supports save/load state functionality
    fn supports_save_states(&self) -> bool {
        false
    }

    /// Get the list of mount points this system supports
    fn mount_points(&self) -> Vec<MountPointInfo>;

    /// Load media into a specific mount point
    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error>;

    /// Unload media from a specific mount point
    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error>;

    /// Check if a mount point has media loaded
    fn is_mounted(&self, mount_point_id: &str) -> bool;
}
