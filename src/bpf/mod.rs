// Classic BPF socket filters: assembly, the capture policy, and an
// interpreter for evaluating programs in user space.

pub mod filter;
pub mod policy;
pub mod vm;

pub use filter::{FilterBuilder, FilterProgram, Label};
pub use policy::build_capture_filter;
