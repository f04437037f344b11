// tests/property_scheduling.rs

//! Property tests for the pending queues and the tag index.

use std::collections::HashMap;
use std::path::PathBuf;

use proptest::prelude::*;

use probuild::action::Priority;
use probuild::driver::PendingQueues;
use probuild::event::EventManager;
use probuild::fs::{File, RootDir, RootKind};
use probuild::tags::{Tag, TagIndex};

const PRIORITIES: [Priority; 7] = [
    Priority::Rules,
    Priority::HostCompilation,
    Priority::HostLink,
    Priority::CodeGen,
    Priority::Compilation,
    Priority::Link,
    Priority::EverythingElse,
];

proptest! {
    /// Pops come out ordered by (priority, insertion order within that
    /// priority), regardless of push order.
    #[test]
    fn queues_pop_by_priority_then_fifo(pushes in proptest::collection::vec((0usize..7, 0usize..1000), 0..64)) {
        let mut queues = PendingQueues::new();
        for (priority, id) in &pushes {
            queues.push(PRIORITIES[*priority], *id);
        }
        prop_assert_eq!(queues.len(), pushes.len());

        let mut expected: Vec<usize> = Vec::new();
        for wanted in 0..7usize {
            for (priority, id) in &pushes {
                if *priority == wanted {
                    expected.push(*id);
                }
            }
        }

        let mut popped = Vec::new();
        while let Some(id) = queues.pop() {
            popped.push(id);
        }
        prop_assert_eq!(popped, expected);
        prop_assert!(queues.is_empty());
    }

    /// However commits and retractions interleave, a tag never has more
    /// than one provider and retraction removes exactly the owner's tags.
    #[test]
    fn index_keeps_tags_unique(ops in proptest::collection::vec((0usize..4, 0usize..6, 0usize..6), 0..64)) {
        let em = EventManager::new();
        let index = TagIndex::new(em.clone());
        let root = File::root(RootDir::new(RootKind::Source, PathBuf::from("/fixture")));

        // Model: tag index -> owner of the current provider.
        let mut model: HashMap<usize, usize> = HashMap::new();

        for (kind, owner, tag_index) in ops {
            let tag = Tag::from_name(&format!("t:{tag_index}"));
            let file = root.relative(&format!("f{owner}.txt")).unwrap();
            match kind {
                0..=2 => {
                    let result = index.commit(owner, &[(file.clone(), vec![tag.clone()])]);
                    match model.get(&tag_index) {
                        Some(existing) if *existing != owner => {
                            prop_assert!(result.is_err());
                        }
                        _ => {
                            prop_assert!(result.is_ok());
                            model.insert(tag_index, owner);
                        }
                    }
                }
                _ => {
                    index.retract(owner);
                    model.retain(|_, current| *current != owner);
                }
            }

            // Drain queued notifications so nothing accumulates.
            while em.turn_once() {}
        }

        for (tag_index, owner) in &model {
            let tag = Tag::from_name(&format!("t:{tag_index}"));
            let provision = index.provider(&tag);
            prop_assert!(provision.is_some());
            prop_assert_eq!(provision.unwrap().owner, *owner);
        }
    }
}
