//! Memoization of extraction results per image id.
//!
//! Each id maps to a once-cell. The map lock only guards finding or creating
//! the cell; the extraction itself runs inside the cell, so concurrent callers
//! for the same id wait for a single computation while other ids proceed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use image::DynamicImage;
use log::debug;
use once_cell::sync::OnceCell;

use crate::{EmbeddingExtractor, EmptyReason, Extraction};

type Slot = Arc<OnceCell<Extraction>>;

#[derive(Default)]
struct Slots {
    map: HashMap<String, Slot>,
    order: VecDeque<String>,
}

#[derive(Default)]
pub struct EmbeddingCache {
    slots: Mutex<Slots>,
    capacity: Option<usize>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` ids, dropping the oldest inserted first.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::default(),
            capacity: Some(capacity.max(1)),
        }
    }

    /// Cached extraction for `image_id`, computing it from `image` on a miss.
    pub fn get_or_compute<E>(&self, image_id: &str, image: &DynamicImage, extractor: &E) -> Extraction
    where
        E: EmbeddingExtractor + ?Sized,
    {
        self.get_or_insert_with(image_id, || extractor.extract(image))
    }

    /// Cached extraction for `image_id`, running `compute` on a miss. "No
    /// face" and invalid-image outcomes are cached like any other; a model
    /// failure is returned but not kept, so the next call retries.
    pub fn get_or_insert_with<F>(&self, image_id: &str, compute: F) -> Extraction
    where
        F: FnOnce() -> Extraction,
    {
        let slot = self.slot(image_id);
        let mut computed = false;
        let value = slot
            .get_or_init(|| {
                computed = true;
                compute()
            })
            .clone();
        if !computed {
            debug!("cache hit for {}", image_id);
        } else if matches!(value.empty_reason(), Some(EmptyReason::ModelFailure(_))) {
            self.forget_slot(image_id, &slot);
        }
        value
    }

    pub fn get(&self, image_id: &str) -> Option<Extraction> {
        self.lock()
            .map
            .get(image_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Store a value directly, replacing any previous one.
    pub fn insert(&self, image_id: &str, value: Extraction) {
        let slot = Arc::new(OnceCell::with_value(value));
        let mut slots = self.lock();
        if slots.map.insert(image_id.to_string(), slot).is_none() {
            slots.order.push_back(image_id.to_string());
            self.evict(&mut slots);
        }
    }

    pub fn remove(&self, image_id: &str) -> Option<Extraction> {
        let mut slots = self.lock();
        let slot = slots.map.remove(image_id)?;
        slots.order.retain(|id| id != image_id);
        slot.get().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut slots = self.lock();
        slots.map.clear();
        slots.order.clear();
    }

    fn slot(&self, image_id: &str) -> Slot {
        let mut slots = self.lock();
        if let Some(slot) = slots.map.get(image_id) {
            return Arc::clone(slot);
        }
        let slot = Slot::default();
        slots.map.insert(image_id.to_string(), Arc::clone(&slot));
        slots.order.push_back(image_id.to_string());
        self.evict(&mut slots);
        slot
    }

    fn forget_slot(&self, image_id: &str, slot: &Slot) {
        let mut slots = self.lock();
        if slots.map.get(image_id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.map.remove(image_id);
            slots.order.retain(|id| id != image_id);
        }
    }

    fn evict(&self, slots: &mut Slots) {
        let Some(capacity) = self.capacity else {
            return;
        };
        while slots.map.len() > capacity {
            match slots.order.pop_front() {
                Some(oldest) => {
                    slots.map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    // A panic elsewhere cannot leave the map half-updated, so a poisoned
    // lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}
