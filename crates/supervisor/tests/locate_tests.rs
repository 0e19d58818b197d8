//! Device locator properties over generated node layouts

mod support;

use common::test_utils::{garmin_descriptor, garmin_signature, other_descriptor};
use proptest::prelude::*;
use supervisor::usb::{FallbackPolicy, LocateOutcome};
use support::DeviceDir;

/// Node at one index: missing, present without descriptor, other device, target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Missing,
    Bare,
    Other,
    Target,
}

fn slot() -> impl Strategy<Value = Slot> {
    prop_oneof![
        Just(Slot::Missing),
        Just(Slot::Bare),
        Just(Slot::Other),
        Just(Slot::Target),
    ]
}

fn build(layout: &[Slot]) -> DeviceDir {
    let mut devices = DeviceDir::new();
    for (index, slot) in layout.iter().enumerate() {
        let index = index as u32;
        match slot {
            Slot::Missing => {}
            Slot::Bare => {
                devices.add(index, None);
            }
            Slot::Other => {
                devices.add(index, Some(other_descriptor()));
            }
            Slot::Target => {
                devices.add(index, Some(garmin_descriptor()));
            }
        }
    }
    devices
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_locate_returns_lowest_matching_index(layout in prop::collection::vec(slot(), 10)) {
        let devices = build(&layout);
        let locator = devices.locator(FallbackPolicy::Strict);

        let expected = layout.iter().position(|s| *s == Slot::Target);
        let found = locator.locate(&garmin_signature()).map(|c| c.index);

        prop_assert_eq!(found, expected.map(|i| i as u32));
    }

    #[test]
    fn prop_strict_never_yields_unverified(layout in prop::collection::vec(slot(), 10)) {
        let devices = build(&layout);
        let locator = devices.locator(FallbackPolicy::Strict);

        prop_assert!(!matches!(
            locator.find(&garmin_signature()),
            LocateOutcome::Unverified(_)
        ));
    }

    #[test]
    fn prop_fallback_only_without_match(layout in prop::collection::vec(slot(), 10)) {
        let devices = build(&layout);
        let locator = devices.locator(FallbackPolicy::FirstPresent);
        let first_present = layout.iter().position(|s| *s != Slot::Missing);

        match locator.find(&garmin_signature()) {
            LocateOutcome::Verified(device) => {
                prop_assert_eq!(layout[device.index as usize], Slot::Target);
            }
            LocateOutcome::Unverified(device) => {
                prop_assert!(!layout.contains(&Slot::Target));
                prop_assert_eq!(Some(device.index as usize), first_present);
            }
            LocateOutcome::NotFound => prop_assert_eq!(first_present, None),
        }
    }
}

#[test]
fn test_candidates_are_ascending_and_existing() {
    let devices = build(&[Slot::Missing, Slot::Bare, Slot::Missing, Slot::Target]);
    let locator = devices.locator(FallbackPolicy::Strict);

    let indexes: Vec<u32> = locator.candidates().iter().map(|c| c.index).collect();
    assert_eq!(indexes, vec![1, 3]);
}
