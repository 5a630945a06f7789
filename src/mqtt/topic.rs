//! Topic filter matching and device topic layout
//!
//! Matching is segment based: filters and topics are split on `/` and compared
//! level by level. A filter of `#` matches every topic, `+` matches exactly one
//! non-empty level and a trailing `/#` matches its parent level plus anything
//! nested below it. Everything else is a case-sensitive literal and the match is
//! anchored at both ends.

use crate::error::{BridgeError, Result};

const MULTI_LEVEL: &str = "#";
const SINGLE_LEVEL: &str = "+";

/// Returns true when `topic` is covered by the subscription `filter`.
pub fn matches(filter: &str, topic: &str) -> bool {
    if filter == MULTI_LEVEL {
        return true;
    }

    let (filter, nested) = match filter.strip_suffix("/#") {
        Some(parent) => (parent, true),
        None => (filter, false),
    };

    let mut levels = topic.split('/');
    for pattern in filter.split('/') {
        let Some(level) = levels.next() else {
            return false;
        };
        let level_matches = if pattern == SINGLE_LEVEL {
            !level.is_empty()
        } else {
            pattern == level
        };
        if !level_matches {
            return false;
        }
    }

    // Anything left over is only allowed below a trailing `/#`.
    levels.next().is_none() || nested
}

/// Checks a subscription filter against the wildcard grammar.
///
/// Accepts `#` on its own, or `/`-separated levels that are either `+` or free
/// of wildcard characters, with `#` permitted only as the final level.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(BridgeError::InvalidFilter(filter.to_string()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        let valid = match *level {
            SINGLE_LEVEL => true,
            MULTI_LEVEL => index == last,
            other => !other.contains(['+', '#']),
        };
        if !valid {
            return Err(BridgeError::InvalidFilter(filter.to_string()));
        }
    }
    Ok(())
}

/// Checks that an outbound topic is usable for publishing.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(BridgeError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Topic on which the broker pushes configuration to a device.
pub fn device_config_topic(device_id: &str) -> String {
    format!("/devices/{}/config", device_id)
}

/// Telemetry topic for a device, optionally below a subfolder.
pub fn device_events_topic(device_id: &str, subfolder: Option<&str>) -> String {
    match subfolder {
        Some(folder) if !folder.is_empty() => format!("/devices/{}/events/{}", device_id, folder),
        _ => format!("/devices/{}/events", device_id),
    }
}
