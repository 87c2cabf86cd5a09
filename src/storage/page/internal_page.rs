//! Internal pages: separator keys and child pointers.
//!
//! Layout: parent page number (u32) | child category (u8) | occupancy bitmap
//! (1 bit per key slot) | fixed-width keys | child page numbers (one more
//! than the keys) | zero padding.
//!
//! Entry `i` is logically the triple (key[i], child[i], child[i+1]):
//! adjacent entries share child pointers. Every key reachable through
//! child[i] is < key[i], and every key reachable through child[i+1] is
//! >= key[i].

use crate::access::value::{DataType, Field};
use crate::storage::error::{DbError, DbResult};
use crate::storage::page::PageCategory;

const INTERNAL_HEADER_SIZE: usize = 5;

#[derive(Debug)]
pub struct InternalPage {
    page_size: usize,
    key_type: DataType,
    parent_no: u32,
    child_category: PageCategory,
    keys: Vec<Field>,
    children: Vec<u32>,
}

impl InternalPage {
    pub fn new(page_size: usize, key_type: DataType) -> Self {
        let page = Self {
            page_size,
            key_type,
            parent_no: 0,
            child_category: PageCategory::Leaf,
            keys: Vec::new(),
            children: Vec::new(),
        };
        assert!(page.capacity() >= 2, "page size too small for this key type");
        page
    }

    /// n keys need n bits, n*key_size bytes, and (n+1) 4-byte children.
    /// Capacity is kept even so a merge of two minimum-occupancy pages
    /// (plus the pulled-down separator) exactly fills one page.
    pub fn capacity_for(page_size: usize, key_size: usize) -> usize {
        let raw = ((page_size - INTERNAL_HEADER_SIZE - 4) * 8) / (key_size * 8 + 33);
        raw - raw % 2
    }

    pub fn capacity(&self) -> usize {
        Self::capacity_for(self.page_size, self.key_type.size())
    }

    /// Minimum entry count of a non-root internal page: ceil(capacity / 2).
    pub fn min_occupancy(&self) -> usize {
        let capacity = self.capacity();
        capacity - capacity / 2
    }

    pub fn num_entries(&self) -> usize {
        self.keys.len()
    }

    pub fn num_empty_slots(&self) -> usize {
        self.capacity() - self.keys.len()
    }

    pub fn is_full(&self) -> bool {
        self.keys.len() == self.capacity()
    }

    pub fn below_min(&self) -> bool {
        self.keys.len() < self.min_occupancy()
    }

    pub fn child_category(&self) -> PageCategory {
        self.child_category
    }

    pub fn set_child_category(&mut self, category: PageCategory) {
        assert!(
            matches!(category, PageCategory::Leaf | PageCategory::Internal),
            "children must be leaf or internal pages"
        );
        self.child_category = category;
    }

    pub fn keys(&self) -> &[Field] {
        &self.keys
    }

    pub fn key(&self, index: usize) -> &Field {
        &self.keys[index]
    }

    pub fn children(&self) -> &[u32] {
        &self.children
    }

    pub fn child(&self, index: usize) -> u32 {
        self.children[index]
    }

    pub fn first_child(&self) -> DbResult<u32> {
        self.children
            .first()
            .copied()
            .ok_or_else(|| DbError::Corrupted("internal page has no children".into()))
    }

    pub fn last_child(&self) -> DbResult<u32> {
        self.children
            .last()
            .copied()
            .ok_or_else(|| DbError::Corrupted("internal page has no children".into()))
    }

    /// Index into `children` selecting the descent target for `key`:
    /// the left child of the first entry whose key is >= the search key,
    /// else the rightmost child. `None` selects the leftmost child.
    pub fn find_child_index(&self, key: Option<&Field>) -> usize {
        match key {
            None => 0,
            Some(key) => self
                .keys
                .partition_point(|k| k.compare(key).is_lt()),
        }
    }

    /// Inserts a separator with its two children. One of `left_no` /
    /// `right_no` must already be present adjacent to the insertion point;
    /// the other is spliced in next to it.
    pub fn insert_entry(&mut self, key: Field, left_no: u32, right_no: u32) -> DbResult<()> {
        if self.is_full() {
            return Err(DbError::Corrupted(format!(
                "insert into full internal page (capacity {})",
                self.capacity()
            )));
        }
        if self.keys.is_empty() && self.children.is_empty() {
            self.keys.push(key);
            self.children.push(left_no);
            self.children.push(right_no);
            return Ok(());
        }

        // Duplicate separator keys are legal, so search the whole equal-key
        // range for the child pointer this entry attaches to.
        let lower = self.keys.partition_point(|k| k.compare(&key).is_lt());
        let upper = self.keys.partition_point(|k| k.compare(&key).is_le());
        for position in lower..=upper {
            if self.children[position] == left_no {
                self.keys.insert(position, key);
                self.children.insert(position + 1, right_no);
                return Ok(());
            }
            if self.children[position] == right_no {
                self.keys.insert(position, key);
                self.children.insert(position, left_no);
                return Ok(());
            }
        }
        Err(DbError::Corrupted(format!(
            "entry with children {} and {} does not connect to this page",
            left_no, right_no
        )))
    }

    /// Rewrites the separator key of entry `index`.
    pub fn update_key(&mut self, index: usize, key: Field) {
        self.keys[index] = key;
    }

    pub fn delete_key_and_right_child(&mut self, index: usize) {
        self.keys.remove(index);
        self.children.remove(index + 1);
    }

    pub fn delete_key_and_left_child(&mut self, index: usize) {
        self.keys.remove(index);
        self.children.remove(index);
    }

    /// Splits off the upper half for an internal split: returns the middle
    /// key (pushed up, removed from both halves) plus the keys and children
    /// of the new right page. `(n-1)/2` entries move right.
    pub fn split_off_upper(&mut self) -> (Field, Vec<Field>, Vec<u32>) {
        let n = self.keys.len();
        let num_to_move = (n - 1) / 2;
        let middle = n - 1 - num_to_move;

        let right_keys = self.keys.split_off(middle + 1);
        let pushed = self.keys.remove(middle);
        let right_children = self.children.split_off(middle + 1);
        (pushed, right_keys, right_children)
    }

    /// Removes the last `count` entries: their keys and their right children.
    pub fn take_back(&mut self, count: usize) -> (Vec<Field>, Vec<u32>) {
        let n = self.keys.len();
        let keys = self.keys.split_off(n - count);
        let children = self.children.split_off(n - count + 1);
        (keys, children)
    }

    /// Removes the first `count` entries: their keys and their left children.
    pub fn take_front(&mut self, count: usize) -> (Vec<Field>, Vec<u32>) {
        let keys_rest = self.keys.split_off(count);
        let keys = std::mem::replace(&mut self.keys, keys_rest);
        let children_rest = self.children.split_off(count);
        let children = std::mem::replace(&mut self.children, children_rest);
        (keys, children)
    }

    pub fn take_all(&mut self) -> (Vec<Field>, Vec<u32>) {
        (
            std::mem::take(&mut self.keys),
            std::mem::take(&mut self.children),
        )
    }

    /// Splices entries onto the left edge; `children` precede the current
    /// leftmost child.
    pub fn prepend_entries(&mut self, mut keys: Vec<Field>, mut children: Vec<u32>) -> DbResult<()> {
        if self.keys.len() + keys.len() > self.capacity() {
            return Err(DbError::Corrupted(
                "prepend would overflow internal page".into(),
            ));
        }
        keys.append(&mut self.keys);
        self.keys = keys;
        children.append(&mut self.children);
        self.children = children;
        Ok(())
    }

    /// Splices entries onto the right edge; `children` follow the current
    /// rightmost child.
    pub fn append_entries(&mut self, mut keys: Vec<Field>, mut children: Vec<u32>) -> DbResult<()> {
        if self.keys.len() + keys.len() > self.capacity() {
            return Err(DbError::Corrupted(
                "append would overflow internal page".into(),
            ));
        }
        self.keys.append(&mut keys);
        self.children.append(&mut children);
        Ok(())
    }

    pub fn parent_no(&self) -> u32 {
        self.parent_no
    }

    pub fn set_parent_no(&mut self, page_no: u32) {
        self.parent_no = page_no;
    }

    pub fn decode(data: &[u8], key_type: DataType) -> DbResult<InternalPage> {
        let page_size = data.len();
        let key_size = key_type.size();
        let capacity = Self::capacity_for(page_size, key_size);
        let bitmap_bytes = (capacity + 7) / 8;
        let keys_offset = INTERNAL_HEADER_SIZE + bitmap_bytes;
        let children_offset = keys_offset + capacity * key_size;

        let parent_no = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let child_category = match PageCategory::from_u8(data[4]) {
            Some(c @ (PageCategory::Leaf | PageCategory::Internal)) => c,
            _ => PageCategory::Leaf,
        };

        let mut keys = Vec::new();
        let mut children = Vec::new();
        let mut last_used = None;
        for slot in 0..capacity {
            let used = data[INTERNAL_HEADER_SIZE + slot / 8] & (1 << (slot % 8)) != 0;
            if used {
                let offset = keys_offset + slot * key_size;
                keys.push(Field::deserialize(key_type, &data[offset..offset + key_size])?);
                let child_at = children_offset + slot * 4;
                children.push(u32::from_le_bytes([
                    data[child_at],
                    data[child_at + 1],
                    data[child_at + 2],
                    data[child_at + 3],
                ]));
                last_used = Some(slot);
            }
        }
        match last_used {
            Some(slot) => {
                let child_at = children_offset + (slot + 1) * 4;
                children.push(u32::from_le_bytes([
                    data[child_at],
                    data[child_at + 1],
                    data[child_at + 2],
                    data[child_at + 3],
                ]));
            }
            None => {
                // A keyless page may still carry a single child while a
                // rebalance is in flight.
                let only = u32::from_le_bytes([
                    data[children_offset],
                    data[children_offset + 1],
                    data[children_offset + 2],
                    data[children_offset + 3],
                ]);
                if only != 0 {
                    children.push(only);
                }
            }
        }

        Ok(InternalPage {
            page_size,
            key_type,
            parent_no,
            child_category,
            keys,
            children,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let key_size = self.key_type.size();
        let capacity = self.capacity();
        let bitmap_bytes = (capacity + 7) / 8;
        let keys_offset = INTERNAL_HEADER_SIZE + bitmap_bytes;
        let children_offset = keys_offset + capacity * key_size;

        let mut buf = vec![0u8; self.page_size];
        buf[0..4].copy_from_slice(&self.parent_no.to_le_bytes());
        buf[4] = self.child_category.as_u8();
        for (slot, key) in self.keys.iter().enumerate() {
            buf[INTERNAL_HEADER_SIZE + slot / 8] |= 1 << (slot % 8);
            let offset = keys_offset + slot * key_size;
            key.serialize_into(&mut buf[offset..offset + key_size]);
        }
        for (slot, child) in self.children.iter().enumerate() {
            let offset = children_offset + slot * 4;
            buf[offset..offset + 4].copy_from_slice(&child.to_le_bytes());
        }
        buf
    }
}
