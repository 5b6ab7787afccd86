//! Disassembly of generated code for testing and debugging purposes.

use std::{collections::BTreeMap, error::Error};

/// Disassembles x64 machine code, interleaving comments recorded at code offsets.
pub(crate) struct AsmPrinter<'a> {
    code: &'a [u8],
    comments: &'a BTreeMap<usize, Vec<String>>,
    /// The address `code` is (or would be) loaded at.
    base: usize,
    /// When true, instruction offset and address are included in the output.
    with_addrs: bool,
}

impl<'a> AsmPrinter<'a> {
    pub(crate) fn new(
        code: &'a [u8],
        comments: &'a BTreeMap<usize, Vec<String>>,
        base: usize,
        with_addrs: bool,
    ) -> Self {
        Self {
            code,
            comments,
            base,
            with_addrs,
        }
    }

    /// Returns the disassembled code.
    pub(crate) fn to_string(&self) -> Result<String, Box<dyn Error>> {
        let mut out = Vec::new();
        let start_ip = u64::try_from(self.base)?;
        let fmt = zydis::Formatter::intel();
        let dec = zydis::Decoder::new64();
        for insn_info in dec.decode_all::<zydis::VisibleOperands>(self.code, start_ip) {
            let (ip, _raw_bytes, insn) = insn_info.map_err(|e| format!("{e:?}"))?;
            let off = ip - start_ip;
            if let Some(lines) = self.comments.get(&usize::try_from(off)?) {
                for line in lines {
                    out.push(format!("; {line}"));
                }
            }
            let istr = fmt.format(Some(ip), &insn).map_err(|e| format!("{e:?}"))?;
            if self.with_addrs {
                out.push(format!("{ip:016x} {off:08x}: {istr}"));
            } else {
                out.push(istr.to_string());
            }
        }
        Ok(out.join("\n"))
    }
}

/// Test helper to use `fm` to match the disassembly of `code`.
#[cfg(test)]
pub(crate) fn match_asm(code: &[u8], ptn: &str) {
    use fm::FMBuilder;

    let comments = BTreeMap::new();
    let dis = AsmPrinter::new(code, &comments, 0, false)
        .to_string()
        .unwrap();
    // The disassembler alternates between upper- and lowercase hex, so lowercase both pattern and
    // text.
    let ptn = ptn.to_lowercase();
    let fmm = FMBuilder::new(&ptn).unwrap().build().unwrap();
    if let Err(e) = fmm.matches(&dis.to_lowercase()) {
        panic!("{e}\n{dis}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_addrs() {
        // nop; ret
        let code = [0x90, 0xC3];
        let mut comments = BTreeMap::new();
        comments.insert(1, vec!["return".to_owned()]);
        let dis = AsmPrinter::new(&code, &comments, 0x4000, true)
            .to_string()
            .unwrap();
        assert_eq!(
            dis,
            "0000000000004000 00000000: nop\n; return\n0000000000004001 00000001: ret"
        );
        let dis = AsmPrinter::new(&code, &comments, 0x4000, false)
            .to_string()
            .unwrap();
        assert_eq!(dis, "nop\n; return\nret");
    }
}
