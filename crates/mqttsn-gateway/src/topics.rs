// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-session topic table.
//!
//! MQTT-SN clients address topics by 16-bit ids. Each session keeps three
//! independent namespaces:
//!
//! - **Registered**: ids allocated by the gateway on REGISTER (or on the first
//!   broker message for a subscribed topic), starting at 1.
//! - **Predefined**: ids seeded from configuration at session creation,
//!   never mutated afterwards.
//! - **Short name**: two-character names carried inline in the frame; not
//!   stored here.

use std::collections::HashMap;

use thiserror::Error;

/// Topic id 0x0000 is reserved by MQTT-SN.
pub const TOPIC_ID_RESERVED_LOW: u16 = 0x0000;

/// Topic id 0xFFFF is reserved by MQTT-SN.
pub const TOPIC_ID_RESERVED_HIGH: u16 = 0xFFFF;

/// Topic level separator.
pub const TOPIC_SEPARATOR: char = '/';

/// Errors from topic allocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic name is empty")]
    EmptyName,

    #[error("no free topic id left in this session")]
    IdsExhausted,
}

/// Bidirectional topic name <-> id mapping for one session.
#[derive(Debug, Clone, Default)]
pub struct TopicTable {
    registered: HashMap<u16, String>,
    registered_ids: HashMap<String, u16>,
    predefined: HashMap<u16, String>,
    next_id: u16,
}

impl TopicTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Create a table pre-seeded with predefined topics.
    pub fn with_predefined(predefined: &HashMap<u16, String>) -> Self {
        let mut table = Self::new();
        for (&id, name) in predefined {
            table.predefined.insert(id, name.clone());
        }
        table
    }

    /// Register `name`, returning its id. Idempotent per name.
    pub fn register(&mut self, name: &str) -> Result<u16, TopicError> {
        if name.is_empty() {
            return Err(TopicError::EmptyName);
        }
        if let Some(&id) = self.registered_ids.get(name) {
            return Ok(id);
        }
        let id = self.allocate_id()?;
        self.registered.insert(id, name.to_string());
        self.registered_ids.insert(name.to_string(), id);
        Ok(id)
    }

    /// Find the next unused id, skipping reserved and predefined ids.
    fn allocate_id(&mut self) -> Result<u16, TopicError> {
        // Usable ids are 1..=0xFFFE.
        let usable = (TOPIC_ID_RESERVED_HIGH - 1) as usize;
        for _ in 0..usable {
            let candidate = self.next_id;
            self.next_id = if candidate >= TOPIC_ID_RESERVED_HIGH - 1 {
                1
            } else {
                candidate + 1
            };
            if candidate == TOPIC_ID_RESERVED_LOW || candidate == TOPIC_ID_RESERVED_HIGH {
                continue;
            }
            if self.registered.contains_key(&candidate) || self.predefined.contains_key(&candidate)
            {
                continue;
            }
            return Ok(candidate);
        }
        Err(TopicError::IdsExhausted)
    }

    /// Look up a registered topic id.
    pub fn registered_name(&self, id: u16) -> Option<&str> {
        self.registered.get(&id).map(String::as_str)
    }

    /// Look up a registered topic name.
    pub fn registered_id(&self, name: &str) -> Option<u16> {
        self.registered_ids.get(name).copied()
    }

    /// Look up a predefined topic id.
    pub fn predefined_name(&self, id: u16) -> Option<&str> {
        self.predefined.get(&id).map(String::as_str)
    }

    /// Reverse lookup in the predefined namespace.
    pub fn predefined_id(&self, name: &str) -> Option<u16> {
        self.predefined
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(&id, _)| id)
    }

    /// Number of registered topics (predefined not included).
    pub fn registered_len(&self) -> usize {
        self.registered.len()
    }

    pub fn predefined_len(&self) -> usize {
        self.predefined.len()
    }
}

/// True if any level of `name` is a `+` or `#` wildcard.
pub fn is_wildcarded(name: &str) -> bool {
    name.split(TOPIC_SEPARATOR)
        .any(|level| level == "+" || level == "#")
}

/// MQTT topic filter matching (`+` one level, `#` remaining levels).
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    // Wildcards never match topics starting with '$'.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split(TOPIC_SEPARATOR);
    let mut topic_levels = topic.split(TOPIC_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
