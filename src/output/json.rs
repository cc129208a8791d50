use std::io::Write;

use crate::bpf::filter::FilterProgram;
use crate::error::NhrpError;

/// Write the filter as JSON: `{"insns": [{"code", "jt", "jf", "k"}, ...]}`.
pub fn write_json(program: &FilterProgram, writer: &mut impl Write) -> Result<(), NhrpError> {
    serde_json::to_writer_pretty(&mut *writer, program)
        .map_err(|e| NhrpError::Serialization(std::io::Error::other(e.to_string())))?;
    writeln!(writer).map_err(NhrpError::Serialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::filter::{BPF_JEQ, BPF_JMP, BPF_K, BPF_RET, FilterBuilder, Label};

    fn program() -> FilterProgram {
        let mut f = FilterBuilder::new(8);
        f.emit_jump(BPF_JMP | BPF_JEQ | BPF_K, 4, Label::Next, Label::Drop);
        f.emit_stmt(BPF_RET | BPF_K, 65535);
        f.mark(Label::Drop);
        f.emit_stmt(BPF_RET | BPF_K, 0);
        f.finalize().unwrap()
    }

    #[test]
    fn json_lists_raw_instructions() {
        let mut buf = Vec::new();
        write_json(&program(), &mut buf).unwrap();
        let output = String::from_utf8(buf).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        let insns = parsed["insns"].as_array().unwrap();
        assert_eq!(insns.len(), 3);
        assert_eq!(insns[0]["code"], 0x15);
        assert_eq!(insns[0]["jt"], 0);
        assert_eq!(insns[0]["jf"], 1);
        assert_eq!(insns[0]["k"], 4);
        assert_eq!(insns[1]["k"], 65535);
    }
}
