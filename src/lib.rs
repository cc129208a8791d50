pub mod address;
pub mod bpf;
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod forward;
pub mod output;
pub mod packet;
pub mod registry;
pub mod sched;
