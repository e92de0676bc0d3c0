//! PID+Page longest-prefix-match trie (§3/§4.1), grounded on `types.h`'s
//! `PIDPage`/`PIDPageMappingInfo` and `BIT_WIDTH_PID`/`BIT_WIDTH_PAGE`.

pub const BIT_WIDTH_PID: u32 = 32;
pub const BIT_WIDTH_PAGE: u32 = 64;
pub const PID_PAGE_PREFIX_LEN: u32 = BIT_WIDTH_PID + BIT_WIDTH_PAGE;

/// Trie key: `pid` and `page` are stored big-endian for LPM matching, as a
/// BPF `BPF_MAP_TYPE_LPM_TRIE` key requires.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PidPageKey {
    pub prefix_len: u32,
    pub pid_be: [u8; 4],
    pub page_be: [u8; 8],
}

impl PidPageKey {
    pub fn exact(pid: u32, page: u64) -> Self {
        Self {
            prefix_len: PID_PAGE_PREFIX_LEN,
            pid_be: pid.to_be_bytes(),
            page_be: page.to_be_bytes(),
        }
    }

    pub fn pid(&self) -> u32 {
        u32::from_be_bytes(self.pid_be)
    }

    pub fn page(&self) -> u64 {
        u64::from_be_bytes(self.page_be)
    }
}

/// The unwind-program tag packed into the high byte of `bias_and_unwinder`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindProgram {
    Native = 0,
    Python = 1,
    Php = 2,
    Ruby = 3,
    Perl = 4,
    V8 = 5,
    Hotspot = 6,
    PhpJit = 7,
}

impl UnwindProgram {
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Native,
            1 => Self::Python,
            2 => Self::Php,
            3 => Self::Ruby,
            4 => Self::Perl,
            5 => Self::V8,
            6 => Self::Hotspot,
            7 => Self::PhpJit,
            _ => return None,
        })
    }
}

const BIAS_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;
const PROGRAM_SHIFT: u32 = 56;

/// `(file_id, bias_and_unwind_program)` value of a PID+page trie entry; the
/// low 7 bytes of the second field are a bias added to the resolved
/// in-module offset, the high byte names which unwind program owns the page.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PidPageEntry {
    pub file_id: u64,
    bias_and_program: u64,
}

impl PidPageEntry {
    pub fn new(file_id: u64, bias: u64, program: UnwindProgram) -> Self {
        Self {
            file_id,
            bias_and_program: (bias & BIAS_MASK) | ((program as u64) << PROGRAM_SHIFT),
        }
    }

    pub const fn bias(&self) -> u64 {
        self.bias_and_program & BIAS_MASK
    }

    pub fn program(&self) -> Option<UnwindProgram> {
        UnwindProgram::from_u8((self.bias_and_program >> PROGRAM_SHIFT) as u8)
    }
}

/// An interpreter dispatch loop's PC range (§4.1/§4.3, GLOSSARY "Interpreter
/// loop range"): a real loader resolves these once per traced binary from
/// symbol boundaries (e.g. `_PyEval_EvalFrameDefault`'s `[start, end)`), and
/// installs a small, fixed-size table of them — there are at most a handful
/// of interpreter loops active in any one process.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct InterpLoopRange {
    pub pc_lo: u64,
    pub pc_hi: u64,
    pub program: u8,
}

impl InterpLoopRange {
    pub fn contains(&self, pc: u64) -> bool {
        self.pc_hi > self.pc_lo && pc >= self.pc_lo && pc < self.pc_hi
    }
}

/// Linear scan over a small, bounded range table — cheap and verifier-legal
/// since `ranges` is always a fixed-size array, never a heap collection.
pub fn find_interp_loop(ranges: &[InterpLoopRange], pc: u64) -> Option<UnwindProgram> {
    ranges.iter().find(|r| r.contains(pc)).and_then(|r| UnwindProgram::from_u8(r.program))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_pid_and_page() {
        let key = PidPageKey::exact(4321, 0x5555_0000);
        assert_eq!(key.pid(), 4321);
        assert_eq!(key.page(), 0x5555_0000);
        assert_eq!(key.prefix_len, PID_PAGE_PREFIX_LEN);
    }

    #[test]
    fn entry_packs_bias_and_program_independently() {
        let entry = PidPageEntry::new(7, 0x1234, UnwindProgram::Python);
        assert_eq!(entry.bias(), 0x1234);
        assert_eq!(entry.program(), Some(UnwindProgram::Python));
        assert_eq!(entry.file_id, 7);
    }

    #[test]
    fn bias_cannot_leak_into_program_byte() {
        let entry = PidPageEntry::new(1, u64::MAX, UnwindProgram::Native);
        assert_eq!(entry.bias(), BIAS_MASK);
        assert_eq!(entry.program(), Some(UnwindProgram::Native));
    }

    #[test]
    fn pc_inside_a_registered_loop_resolves_to_its_program() {
        let ranges = [
            InterpLoopRange { pc_lo: 0x1000, pc_hi: 0x2000, program: UnwindProgram::Python as u8 },
            InterpLoopRange { pc_lo: 0x5000, pc_hi: 0x6000, program: UnwindProgram::Ruby as u8 },
        ];
        assert_eq!(find_interp_loop(&ranges, 0x1500), Some(UnwindProgram::Python));
        assert_eq!(find_interp_loop(&ranges, 0x5800), Some(UnwindProgram::Ruby));
    }

    #[test]
    fn pc_outside_every_range_resolves_to_none() {
        let ranges = [InterpLoopRange { pc_lo: 0x1000, pc_hi: 0x2000, program: UnwindProgram::Python as u8 }];
        assert_eq!(find_interp_loop(&ranges, 0x9000), None);
    }
}
