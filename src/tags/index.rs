// src/tags/index.rs

//! The bidirectional tag/provision index.
//!
//! `tag -> file` is unique (second insert with a different owner is a
//! conflict error); `owner -> tags` supports atomic retraction of all of an
//! action's provisions. Subscriber notifications are queued through the
//! event manager, never delivered synchronously from the mutation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::errors::{BuildError, Result};
use crate::event::EventManager;
use crate::fs::File;

use super::Tag;

/// Identifies the action record that committed a provision.
pub type RecordId = usize;

#[derive(Clone)]
pub struct Provision {
    pub file: File,
    pub owner: RecordId,
}

struct Subscriber {
    id: u64,
    /// The record this subscription belongs to, if any. A change caused by
    /// that same record does not notify it: an action that provides a tag
    /// it also looked up must not invalidate itself forever.
    owner: Option<RecordId>,
    callback: Rc<dyn Fn()>,
}

struct IndexInner {
    providers: HashMap<Tag, Provision>,
    by_owner: HashMap<RecordId, Vec<Tag>>,
    subscribers: HashMap<Tag, Vec<Subscriber>>,
    next_subscriber: u64,
}

#[derive(Clone)]
pub struct TagIndex {
    em: EventManager,
    inner: Rc<RefCell<IndexInner>>,
}

/// Subscription to a tag's insert/delete notifications; dropping it
/// unsubscribes.
pub struct TagSubscription {
    inner: Weak<RefCell<IndexInner>>,
    tag: Tag,
    id: u64,
}

impl Drop for TagSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.borrow_mut();
            if let Some(subscribers) = inner.subscribers.get_mut(&self.tag) {
                subscribers.retain(|subscriber| subscriber.id != self.id);
                if subscribers.is_empty() {
                    inner.subscribers.remove(&self.tag);
                }
            }
        }
    }
}

impl TagIndex {
    pub fn new(em: EventManager) -> TagIndex {
        TagIndex {
            em,
            inner: Rc::new(RefCell::new(IndexInner {
                providers: HashMap::new(),
                by_owner: HashMap::new(),
                subscribers: HashMap::new(),
                next_subscriber: 1,
            })),
        }
    }

    /// Current provider of a tag, if any. A plain snapshot lookup; use
    /// [`subscribe`](Self::subscribe) to hear about changes.
    pub fn provider(&self, tag: &Tag) -> Option<Provision> {
        self.inner.borrow().providers.get(tag).cloned()
    }

    /// All committed provisions.
    pub fn all_provisions(&self) -> Vec<(Tag, Provision)> {
        self.inner
            .borrow()
            .providers
            .iter()
            .map(|(tag, provision)| (tag.clone(), provision.clone()))
            .collect()
    }

    /// Install all of an action's provisions at once. Nothing is installed
    /// if any tag is already provided by a different file.
    pub fn commit(&self, owner: RecordId, provisions: &[(File, Vec<Tag>)]) -> Result<()> {
        {
            let inner = self.inner.borrow();
            for (file, tags) in provisions {
                for tag in tags {
                    if let Some(existing) = inner.providers.get(tag) {
                        if existing.file != *file || existing.owner != owner {
                            return Err(BuildError::TagConflict {
                                tag: tag.to_string(),
                                existing: existing.file.to_string(),
                            });
                        }
                    }
                }
            }
        }

        let mut inserted = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            for (file, tags) in provisions {
                for tag in tags {
                    inner.providers.insert(
                        tag.clone(),
                        Provision {
                            file: file.clone(),
                            owner,
                        },
                    );
                    inner.by_owner.entry(owner).or_default().push(tag.clone());
                    inserted.push(tag.clone());
                }
            }
        }
        for tag in inserted {
            debug!(tag = %tag, owner, "provision committed");
            self.notify(&tag, Some(owner));
        }
        Ok(())
    }

    /// Remove all of an owner's provisions atomically.
    pub fn retract(&self, owner: RecordId) {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            let tags = inner.by_owner.remove(&owner).unwrap_or_default();
            let mut removed = Vec::new();
            for tag in tags {
                if let Some(provision) = inner.providers.get(&tag) {
                    if provision.owner == owner {
                        inner.providers.remove(&tag);
                        removed.push(tag);
                    }
                }
            }
            removed
        };
        for tag in removed {
            debug!(tag = %tag, owner, "provision retracted");
            self.notify(&tag, Some(owner));
        }
    }

    /// Register interest in a tag. The callback runs on a later loop turn
    /// whenever the tag's provider is inserted or removed, except for
    /// changes committed by `owner` itself.
    pub fn subscribe(
        &self,
        tag: &Tag,
        owner: Option<RecordId>,
        callback: impl Fn() + 'static,
    ) -> TagSubscription {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner
            .subscribers
            .entry(tag.clone())
            .or_default()
            .push(Subscriber {
                id,
                owner,
                callback: Rc::new(callback),
            });
        TagSubscription {
            inner: Rc::downgrade(&self.inner),
            tag: tag.clone(),
            id,
        }
    }

    fn notify(&self, tag: &Tag, source: Option<RecordId>) {
        let callbacks: Vec<Rc<dyn Fn()>> = match self.inner.borrow().subscribers.get(tag) {
            Some(subscribers) => subscribers
                .iter()
                .filter(|subscriber| {
                    subscriber.owner.is_none() || subscriber.owner != source
                })
                .map(|subscriber| subscriber.callback.clone())
                .collect(),
            None => return,
        };
        for callback in callbacks {
            self.em.run_detached(move || callback());
        }
    }
}
