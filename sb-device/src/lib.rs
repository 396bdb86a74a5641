mod boards;
mod ports;
mod relay;
mod toolchain;

pub use boards::{BOARD_CATALOG, BoardProfile, display_name};
pub use ports::{PortDescriptor, PortScan, scan_ports};
pub use relay::{
    ClientEnvelope, DEFAULT_BAUD, PortClaim, RelayConfig, RelayError, RelayEvent, RelayRegistry,
    RelaySession, ServerEnvelope, SharedRelayRegistry, new_relay_registry,
};
pub use toolchain::{
    CompileOutcome, SKETCH_EXTENSION, ToolRunReport, ToolchainConfig, ToolchainError,
    ToolchainInvoker,
};
