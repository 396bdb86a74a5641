mod server;

pub use server::{SketchEntry, StoreError, WorkbenchConfig, WorkbenchState, build_workbench_app};
