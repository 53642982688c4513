//! # Pending-Operation Store
//!
//! Tab-scoped session storage used to hand a request to a context that did
//! not exist when the request arrived. Records are keyed by
//! `credentials.<operation>.<route>` and consumed by the first read.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::message::Operation;
use crate::origin::Origin;

/// The leg of a flow a record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Requester parameters waiting for the holder.
    Params,
    /// Holder result waiting for the requester.
    Result,
    /// Origin of the requester a relayed flow must answer.
    Requester,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Params => "params",
            Self::Result => "result",
            Self::Requester => "requester",
        })
    }
}

/// A request or result parked for a counterpart.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PendingRecord {
    /// `<unix-millis>-<nonce>`.
    pub id: String,

    /// Origin of the context the data was received from.
    pub origin: Origin,

    /// The parked payload.
    pub data: Value,
}

/// Session storage for one origin in one tab.
#[derive(Debug, Default)]
pub struct SessionStore {
    items: Mutex<HashMap<String, String>>,
}

impl SessionStore {
    /// The storage key for a record.
    #[must_use]
    pub fn key(op: Operation, route: Route) -> String {
        format!("credentials.{op}.{route}")
    }

    fn items(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park `data` received from `origin`, replacing any unconsumed record for
    /// the same operation and route.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized.
    pub fn put(&self, op: Operation, route: Route, origin: Origin, data: Value) -> Result<PendingRecord> {
        let nonce = Uuid::new_v4().simple().to_string();
        let record = PendingRecord {
            id: format!("{}-{}", Utc::now().timestamp_millis(), &nonce[..8]),
            origin,
            data,
        };
        let key = Self::key(op, route);
        tracing::debug!(%key, id = %record.id, "storing pending record");
        self.items().insert(key, serde_json::to_string(&record)?);
        Ok(record)
    }

    /// Whether an unconsumed record exists.
    #[must_use]
    pub fn contains(&self, op: Operation, route: Route) -> bool {
        self.items().contains_key(&Self::key(op, route))
    }

    /// Remove and return a record. A record is returned at most once.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored record is corrupt. The corrupt entry is
    /// removed either way.
    pub fn take(&self, op: Operation, route: Route) -> Result<Option<PendingRecord>> {
        let Some(item) = self.items().remove(&Self::key(op, route)) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&item)?))
    }

    /// Write a raw item, as any script with access to the storage could.
    pub fn set_item(&self, key: impl Into<String>, value: impl Into<String>) {
        self.items().insert(key.into(), value.into());
    }
}
