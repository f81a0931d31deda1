mod driver;
mod harness;
mod mark;
mod output;
mod plugin;

pub use driver::{Driver, DriverCommand, ProcessOutput};
pub use mark::{collect as collect_marks, sentinel_token, split_output};
pub use output::{ExecOutput, Mark, MarkEntry, Text};
pub use plugin::{Plugin, PythonConfig, PythonPlugin};
