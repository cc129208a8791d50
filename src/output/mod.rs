pub mod json;
pub mod text;

use std::io::Write;

use crate::bpf::filter::FilterProgram;
use crate::cli::OutputFormat;
use crate::error::NhrpError;

/// Write a synthesized capture filter in the specified format.
pub fn write_filter(
    program: &FilterProgram,
    format: OutputFormat,
    writer: &mut impl Write,
) -> Result<(), NhrpError> {
    match format {
        OutputFormat::Text => text::write_text(program, writer),
        OutputFormat::Json => json::write_json(program, writer),
    }
}
