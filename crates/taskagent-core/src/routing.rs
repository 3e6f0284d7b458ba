//! Routing address grammar for the publish/subscribe fabric.
//!
//! Addresses are dot-delimited words:
//!
//! | Address                                               | Meaning                  |
//! |-------------------------------------------------------|--------------------------|
//! | `<resource>.<uuid>.task.<task>`                       | task request             |
//! | `<resource>.<uuid>.event.<event>.<clientId>.<taskId>` | task event to the caller |
//! | `<resource>.ping.<uuid>`                              | health probe             |
//! | `<resource>.ack.<clientId>.<uuid>`                    | health probe reply       |
//! | `<resource>._nop.<uuid>`                              | heartbeat                |
//!
//! Subscription patterns use topic-exchange wildcards: `*` matches exactly one
//! word and `#` matches zero or more words.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A parsed routing address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    Task {
        resource: String,
        uuid: String,
        task: String,
    },
    Event {
        resource: String,
        uuid: String,
        event: String,
        client_id: String,
        task_id: String,
    },
    Ping {
        resource: String,
        uuid: String,
    },
    PingReply {
        resource: String,
        client_id: String,
        uuid: String,
    },
    Heartbeat {
        resource: String,
        uuid: String,
    },
}

impl RoutingKey {
    pub fn task(resource: &str, uuid: &str, task: &str) -> Self {
        Self::Task {
            resource: resource.to_string(),
            uuid: uuid.to_string(),
            task: task.to_string(),
        }
    }

    pub fn event(resource: &str, uuid: &str, event: &str, client_id: &str, task_id: &str) -> Self {
        Self::Event {
            resource: resource.to_string(),
            uuid: uuid.to_string(),
            event: event.to_string(),
            client_id: client_id.to_string(),
            task_id: task_id.to_string(),
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task {
                resource,
                uuid,
                task,
            } => write!(f, "{resource}.{uuid}.task.{task}"),
            Self::Event {
                resource,
                uuid,
                event,
                client_id,
                task_id,
            } => write!(f, "{resource}.{uuid}.event.{event}.{client_id}.{task_id}"),
            Self::Ping { resource, uuid } => write!(f, "{resource}.ping.{uuid}"),
            Self::PingReply {
                resource,
                client_id,
                uuid,
            } => write!(f, "{resource}.ack.{client_id}.{uuid}"),
            Self::Heartbeat { resource, uuid } => write!(f, "{resource}._nop.{uuid}"),
        }
    }
}

impl FromStr for RoutingKey {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = key.split('.').collect();
        if words.iter().any(|w| w.is_empty()) {
            return Err(Error::Routing(key.to_string()));
        }
        let owned = |w: &str| w.to_string();
        match words.as_slice() {
            [resource, "ping", uuid] => Ok(Self::Ping {
                resource: owned(resource),
                uuid: owned(uuid),
            }),
            [resource, "_nop", uuid] => Ok(Self::Heartbeat {
                resource: owned(resource),
                uuid: owned(uuid),
            }),
            [resource, "ack", client_id, uuid] => Ok(Self::PingReply {
                resource: owned(resource),
                client_id: owned(client_id),
                uuid: owned(uuid),
            }),
            [resource, uuid, "task", task] => Ok(Self::Task {
                resource: owned(resource),
                uuid: owned(uuid),
                task: owned(task),
            }),
            [resource, uuid, "event", event, client_id, task_id] => Ok(Self::Event {
                resource: owned(resource),
                uuid: owned(uuid),
                event: owned(event),
                client_id: owned(client_id),
                task_id: owned(task_id),
            }),
            _ => Err(Error::Routing(key.to_string())),
        }
    }
}

/// Pattern matching every task request a queue serves for `task`.
pub fn task_pattern(resource: &str, uuid: &str, task: &str) -> String {
    RoutingKey::task(resource, uuid, task).to_string()
}

/// Pattern matching every event addressed to `client_id` by the agent
/// identified by `resource`/`uuid`.
pub fn event_pattern(resource: &str, uuid: &str, client_id: &str) -> String {
    format!("{resource}.{uuid}.event.*.{client_id}.*")
}

/// Topic-exchange match of `key` against `pattern`.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            matches_words(rest, key) || (!key.is_empty() && matches_words(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => matches_words(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && matches_words(rest, key_rest)
        }
        _ => false,
    }
}
