//! FIFO queue of pending collar requests
//!
//! Holds requests that have been submitted but not yet acknowledged. Order
//! is strictly insertion order, with no priorities and no reordering. All
//! operations on an empty queue are absence-returning no-ops rather than
//! errors.

use crate::envelope::Request;
use std::collections::VecDeque;

/// Ordered collection of not-yet-acknowledged requests
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: VecDeque<Request>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append a request to the tail
    pub fn push(&mut self, request: Request) {
        self.entries.push_back(request);
    }

    /// Append several requests, preserving their order
    pub fn push_all(&mut self, requests: impl IntoIterator<Item = Request>) {
        self.entries.extend(requests);
    }

    /// Non-destructive look at the head
    pub fn head(&self) -> Option<&Request> {
        self.entries.front()
    }

    /// Remove and return the head
    pub fn pop(&mut self) -> Option<Request> {
        self.entries.pop_front()
    }

    /// Remove the first structurally-equal entry, anywhere in the queue
    ///
    /// Returns whether a removal occurred.
    pub fn remove(&mut self, request: &Request) -> bool {
        match self.entries.iter().position(|entry| entry == request) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
