pub mod netlist;
pub mod xyce;

pub use netlist::{Netlist, TransientSpec, inject_transient_directive};
pub use xyce::{
    SimulationResult, Simulator, SimulatorConfig, XyceRunner, output_path, parse_output,
};
