use std::io::Write;

use crate::bpf::filter::FilterProgram;
use crate::error::NhrpError;

/// Pseudo-assembly listing, one instruction per line.
pub fn write_text(program: &FilterProgram, writer: &mut impl Write) -> Result<(), NhrpError> {
    write!(writer, "{program}").map_err(NhrpError::Serialization)?;
    writeln!(writer, "; {} instructions", program.len()).map_err(NhrpError::Serialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::filter::{BPF_RET, BPF_K, FilterBuilder};

    #[test]
    fn listing_ends_with_count() {
        let mut f = FilterBuilder::new(4);
        f.emit_stmt(BPF_RET | BPF_K, 0);
        let mut buf = Vec::new();
        write_text(&f.finalize().unwrap(), &mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "[  0] ret  #0\n; 1 instructions\n");
    }
}
