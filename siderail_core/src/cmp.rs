//! Comparison feedback.
//!
//! Each instrumented comparison owns one map byte (indexed by its branch id)
//! holding which outcomes have been seen so far. The driver can then tell a
//! branch that only ever went one way from one that has been fully explored.

use crate::config::MAP_SIZE;
use crate::map::Area;

/// Relational predicate of an instrumented comparison.
///
/// Not-equal sites share the equality tags: the record tracks both outcomes
/// of the same comparison, so `==` and `!=` are symmetric here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpKind {
    Greater,
    Equal,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

impl CmpKind {
    /// Maps the instrumentation pass's predicate tag. Unknown tags are ignored.
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 | 1 => Some(CmpKind::Greater),
            2 | 7 | 11 => Some(CmpKind::Equal),
            3 | 4 => Some(CmpKind::GreaterOrEqual),
            5 | 6 => Some(CmpKind::Less),
            8 | 9 => Some(CmpKind::LessOrEqual),
            _ => None,
        }
    }

    /// Whether `op1 - op2 == distance` satisfies the predicate.
    pub fn holds(self, distance: i128) -> bool {
        match self {
            CmpKind::Greater => distance > 0,
            CmpKind::Equal => distance == 0,
            CmpKind::GreaterOrEqual => distance >= 0,
            CmpKind::Less => distance < 0,
            CmpKind::LessOrEqual => distance <= 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BranchState {
    Unseen = 0,
    OnlyTrue = 1,
    OnlyFalse = 2,
    /// Both outcomes observed. Terminal.
    Both = 3,
}

impl BranchState {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => BranchState::Unseen,
            1 => BranchState::OnlyTrue,
            2 => BranchState::OnlyFalse,
            _ => BranchState::Both,
        }
    }

    /// Parses a whole byte; `None` if it holds anything but a bare state.
    pub fn from_byte(byte: u8) -> Option<Self> {
        (byte <= 0b11).then(|| Self::from_bits(byte))
    }

    pub fn observe(self, outcome: bool) -> Self {
        match (self, outcome) {
            (BranchState::Unseen, true) => BranchState::OnlyTrue,
            (BranchState::Unseen, false) => BranchState::OnlyFalse,
            (BranchState::OnlyTrue, false) | (BranchState::OnlyFalse, true) => BranchState::Both,
            (state, _) => state,
        }
    }
}

/// A prefix-comparison record: 2-bit state plus the 6-bit compared length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixRecord {
    pub state: BranchState,
    pub len: u8,
}

impl PrefixRecord {
    pub const MAX_LEN: u8 = 0x3f;

    pub fn from_byte(byte: u8) -> Self {
        Self {
            state: BranchState::from_bits(byte),
            len: byte >> 2,
        }
    }

    pub fn to_byte(self) -> u8 {
        self.state as u8 | (self.len & Self::MAX_LEN) << 2
    }
}

/// Integer operand widths the encoder accepts.
pub trait Operand: Copy {
    /// `self - other`, computed without overflow.
    fn distance(self, other: Self) -> i128;
    /// The value as stored in a 32-bit extraction slot (truncating).
    fn as_record(self) -> i32;
}

macro_rules! impl_operand {
    ($($ty:ty),*) => {
        $(
            impl Operand for $ty {
                #[inline]
                fn distance(self, other: Self) -> i128 {
                    self as i128 - other as i128
                }

                #[inline]
                fn as_record(self) -> i32 {
                    self as i32
                }
            }
        )*
    };
}

impl_operand!(i8, i16, i32, i64);

pub fn branch_slot(br_id: i32) -> usize {
    br_id as u32 as usize & (MAP_SIZE - 1)
}

fn observe_slot(area: Area<'_>, br_id: i32, outcome: bool) -> Option<BranchState> {
    let slot = branch_slot(br_id);
    // A byte that is not a bare state belongs to something else; leave it.
    let current = BranchState::from_byte(area.get(slot))?;
    let next = current.observe(outcome);
    if next != current {
        area.set(slot, next as u8);
    }
    Some(next)
}

/// Records the outcome of an integer comparison at `br_id`.
///
/// Returns the record's state afterwards, or `None` if nothing was recorded.
pub fn log_branch<T: Operand>(
    area: Area<'_>,
    br_id: i32,
    tag: i32,
    op1: T,
    op2: T,
) -> Option<BranchState> {
    let kind = CmpKind::from_tag(tag)?;
    observe_slot(area, br_id, kind.holds(op1.distance(op2)))
}

/// Records a full string comparison given its return code.
pub fn log_strcmp(area: Area<'_>, br_id: i32, ret: i32) -> Option<BranchState> {
    observe_slot(area, br_id, ret == 0)
}

/// Records a bounded string comparison.
///
/// The compared length is stored only by the first transition that finds
/// the length field empty; later transitions keep it even if `len` grows.
pub fn log_strncmp(area: Area<'_>, br_id: i32, len: i32, ret: i32) -> PrefixRecord {
    let slot = branch_slot(br_id);
    let current = PrefixRecord::from_byte(area.get(slot));
    if current.state == BranchState::Both {
        return current;
    }

    let state = current.state.observe(ret == 0);
    if state == current.state {
        return current;
    }

    let len = if current.len != 0 {
        current.len
    } else {
        len as u8 & PrefixRecord::MAX_LEN
    };
    let next = PrefixRecord { state, len };
    area.set(slot, next.to_byte());
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map;
    use std::sync::atomic::AtomicU8;

    const EQ: i32 = 2;

    fn backing() -> Vec<AtomicU8> {
        map::scratch(MAP_SIZE)
    }

    #[test]
    fn tag_mapping_matches_instrumentation_pass() {
        let expected = [
            (0, Some(CmpKind::Greater)),
            (1, Some(CmpKind::Greater)),
            (2, Some(CmpKind::Equal)),
            (3, Some(CmpKind::GreaterOrEqual)),
            (4, Some(CmpKind::GreaterOrEqual)),
            (5, Some(CmpKind::Less)),
            (6, Some(CmpKind::Less)),
            (7, Some(CmpKind::Equal)),
            (8, Some(CmpKind::LessOrEqual)),
            (9, Some(CmpKind::LessOrEqual)),
            (10, None),
            (11, Some(CmpKind::Equal)),
            (12, None),
            (-1, None),
        ];
        for (tag, kind) in expected {
            assert_eq!(CmpKind::from_tag(tag), kind, "tag {tag}");
        }
    }

    #[test]
    fn equal_then_unequal_reaches_both() {
        let backing = backing();
        let area = Area::new(&backing);
        assert_eq!(log_branch(area, 40, EQ, 5i32, 5), Some(BranchState::OnlyTrue));
        assert_eq!(area.get(40), 1);
        assert_eq!(log_branch(area, 40, EQ, 5i32, 6), Some(BranchState::Both));
        assert_eq!(area.get(40), 3);
    }

    #[test]
    fn repeated_equal_pairs_stay_only_true() {
        let backing = backing();
        let area = Area::new(&backing);
        for _ in 0..10 {
            log_branch(area, 40, EQ, 9i8, 9);
        }
        assert_eq!(area.get(40), BranchState::OnlyTrue as u8);
    }

    #[test]
    fn both_is_terminal() {
        let backing = backing();
        let area = Area::new(&backing);
        log_branch(area, 3, 5, 1i16, 2);
        log_branch(area, 3, 5, 2i16, 1);
        assert_eq!(area.get(3), 3);
        for (a, b) in [(1i16, 2), (2, 1), (0, 0)] {
            assert_eq!(log_branch(area, 3, 5, a, b), Some(BranchState::Both));
        }
        assert_eq!(area.get(3), 3);
    }

    #[test]
    fn predicates_follow_sign_of_distance() {
        let cases: [(i32, i64, i64, BranchState); 6] = [
            (0, 2, 1, BranchState::OnlyTrue),
            (0, 1, 1, BranchState::OnlyFalse),
            (3, 1, 1, BranchState::OnlyTrue),
            (5, 1, 1, BranchState::OnlyFalse),
            (8, 1, 1, BranchState::OnlyTrue),
            (8, 2, 1, BranchState::OnlyFalse),
        ];
        for (tag, a, b, expected) in cases {
            let backing = backing();
        let area = Area::new(&backing);
            assert_eq!(log_branch(area, 1, tag, a, b), Some(expected), "tag {tag} {a} vs {b}");
        }
    }

    #[test]
    fn wide_operands_do_not_overflow() {
        let backing = backing();
        let area = Area::new(&backing);
        // i64::MIN - 1 would wrap to a positive distance.
        assert_eq!(
            log_branch(area, 8, 0, i64::MIN, 1),
            Some(BranchState::OnlyFalse),
            "MIN > 1 must be false"
        );
    }

    #[test]
    fn unknown_tag_is_noop() {
        let backing = backing();
        let area = Area::new(&backing);
        assert_eq!(log_branch(area, 4, 10, 1i32, 1), None);
        assert_eq!(area.get(4), 0);
    }

    #[test]
    fn foreign_bytes_are_left_alone() {
        let backing = backing();
        let area = Area::new(&backing);
        area.set(6, 0x40);
        assert_eq!(log_branch(area, 6, EQ, 1i32, 1), None);
        assert_eq!(area.get(6), 0x40);
    }

    #[test]
    fn branch_ids_wrap_into_map() {
        let backing = backing();
        let area = Area::new(&backing);
        log_branch(area, MAP_SIZE as i32 + 2, EQ, 0i32, 0);
        assert_eq!(area.get(2), 1);
        log_branch(area, -1, EQ, 0i32, 0);
        assert_eq!(area.get(MAP_SIZE - 1), 1);
    }

    #[test]
    fn strcmp_uses_return_code() {
        let backing = backing();
        let area = Area::new(&backing);
        assert_eq!(log_strcmp(area, 11, -3), Some(BranchState::OnlyFalse));
        assert_eq!(log_strcmp(area, 11, 0), Some(BranchState::Both));
    }

    #[test]
    fn strncmp_packs_length_first_write_wins() {
        let backing = backing();
        let area = Area::new(&backing);
        let first = log_strncmp(area, 20, 4, 1);
        assert_eq!(first, PrefixRecord { state: BranchState::OnlyFalse, len: 4 });
        assert_eq!(area.get(20), 2 | 4 << 2);

        // Same outcome: nothing changes, not even with a longer prefix.
        log_strncmp(area, 20, 9, 1);
        assert_eq!(area.get(20), 2 | 4 << 2);

        let done = log_strncmp(area, 20, 16, 0);
        assert_eq!(done, PrefixRecord { state: BranchState::Both, len: 4 });
        assert_eq!(area.get(20), 3 | 4 << 2);

        log_strncmp(area, 20, 1, 1);
        assert_eq!(area.get(20), 3 | 4 << 2, "Fully explored record is frozen");
    }

    #[test]
    fn strncmp_length_is_truncated_to_six_bits() {
        let backing = backing();
        let area = Area::new(&backing);
        let record = log_strncmp(area, 1, 64 + 5, 0);
        assert_eq!(record.len, 5);
        assert_eq!(PrefixRecord::from_byte(area.get(1)), record);
    }
}
