//! Slot selection for outbound ATT operations

use super::types::EattChannelSlot;

/// Picks the slot for an operation of `priority` carrying `size` bytes.
///
/// Slots are scanned in index order; the first one that is open, idle, at
/// least as important as requested and large enough wins. `None` means the
/// caller should use the legacy bearer.
pub fn select_slot(slots: &[EattChannelSlot], priority: u8, size: usize) -> Option<usize> {
    slots
        .iter()
        .position(|slot| slot.is_available() && slot.priority >= priority && slot.local_mtu as usize >= size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn slot(priority: u8, local_mtu: u16) -> EattChannelSlot {
        EattChannelSlot {
            cid: 0x0040,
            local_mtu,
            in_use: true,
            ..EattChannelSlot::new(priority)
        }
    }

    #[test]
    fn test_lowest_matching_index_wins() {
        let slots = vec![slot(0, 100), slot(2, 64), slot(2, 200), slot(5, 300)];

        assert_eq!(select_slot(&slots, 0, 50), Some(0));
        assert_eq!(select_slot(&slots, 1, 50), Some(1));
        assert_eq!(select_slot(&slots, 1, 150), Some(2));
        assert_eq!(select_slot(&slots, 3, 10), Some(3));
        assert_eq!(select_slot(&slots, 6, 10), None);
        assert_eq!(select_slot(&slots, 0, 301), None);
    }

    #[test]
    fn test_busy_and_unused_slots_are_skipped() {
        let mut slots = vec![slot(0, 100), slot(0, 100), slot(0, 100)];
        slots[0].in_use = false;
        slots[1].awaiting_response = true;

        assert_eq!(select_slot(&slots, 0, 10), Some(2));

        slots[2].sdu_in_flight = true;
        assert_eq!(select_slot(&slots, 0, 10), None);
    }

    #[derive(Debug, Clone)]
    struct SlotTable(Vec<EattChannelSlot>);

    impl Arbitrary for SlotTable {
        fn arbitrary(g: &mut Gen) -> Self {
            let len = usize::arbitrary(g) % 8;
            let slots = (0..len)
                .map(|_| EattChannelSlot {
                    cid: 0x0040,
                    local_mtu: u16::arbitrary(g) % 600,
                    in_use: bool::arbitrary(g),
                    sdu_in_flight: bool::arbitrary(g),
                    awaiting_response: bool::arbitrary(g),
                    ..EattChannelSlot::new(u8::arbitrary(g) % 4)
                })
                .collect();
            SlotTable(slots)
        }
    }

    #[quickcheck]
    fn prop_selection_is_first_eligible(table: SlotTable, priority: u8, size: u16) -> bool {
        let priority = priority % 4;
        let size = size as usize % 600;
        let chosen = select_slot(&table.0, priority, size);

        let eligible =
            |slot: &EattChannelSlot| slot.is_available() && slot.priority >= priority && slot.local_mtu as usize >= size;

        match chosen {
            Some(index) => eligible(&table.0[index]) && !table.0[..index].iter().any(eligible),
            None => !table.0.iter().any(eligible),
        }
    }
}
