//! # Draft Sync Core
//!
//! Local-first draft protection for form-style documents: user input is
//! never silently lost between autosave cycles, across closes, app
//! backgrounding, or flaky networks, while a single authoritative remote
//! copy is kept up to date.
//!
//! ## Pieces
//!
//! - [`snapshot_store::SnapshotStore`] - synchronous, best-effort local
//!   snapshots on LMDB with a file fallback. Never fails into caller code.
//! - [`remote_sync::DebouncedSync`] - coalesces bursts of edits into one
//!   remote write, retries with backoff, reports a [`remote_sync::SyncStatus`].
//! - [`lifecycle::LifecycleGuards`] - flushes the latest draft when the host
//!   is about to close or goes to the background.
//! - [`restore::RestoreNegotiation`] - offers a newer local snapshot back to
//!   the user once the remote copy has loaded.
//! - [`controller::DraftController`] - all of the above for one open document.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use draft_sync_core::config::SyncConfig;
//! use draft_sync_core::controller::DraftController;
//! use draft_sync_core::error::RemoteError;
//! use draft_sync_core::remote_sync::RemoteDocuments;
//! use draft_sync_core::restore::RestoreSession;
//! use draft_sync_core::snapshot_model::DocumentKey;
//! use draft_sync_core::snapshot_store::SnapshotStore;
//! use serde_json::{json, Value};
//!
//! struct Api;
//!
//! #[async_trait]
//! impl RemoteDocuments<Value> for Api {
//!     async fn load(&self, _key: &DocumentKey) -> Result<Option<Value>, RemoteError> {
//!         Ok(None)
//!     }
//!     async fn save(&self, _key: &DocumentKey, _data: &Value) -> Result<(), RemoteError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SnapshotStore::in_memory("weekly_plan"));
//! let session = RestoreSession::new();
//! let plan = DraftController::<Value>::open(
//!     DocumentKey::new("2024-W03"),
//!     store,
//!     Arc::new(Api),
//!     SyncConfig::default(),
//!     &session,
//! )
//! .await?;
//!
//! plan.edit(json!({"focus": "ship the release"}));
//! # Ok(())
//! # }
//! ```
//!
//! ## FFI Functions
//!
//! The snapshot store is also exposed to native hosts. Every function returns
//! a JSON [`AppResponse`](app_response::AppResponse) string that must be
//! released with [`free_response`].
//!
//! - [`create_snapshot_store`] - open a store from a JSON `StoreConfig`
//! - [`save_snapshot`] - write a snapshot for a document key
//! - [`load_snapshot`] - read the snapshot for a document key
//! - [`clear_snapshot`] - drop the snapshot for a document key
//! - [`clear_all_snapshots`] - drop every snapshot
//! - [`close_snapshot_store`] - flush and close the backends
//! - [`destroy_snapshot_store`] - free the store handle

pub mod app_response;
pub mod config;
pub mod controller;
pub mod debounce;
pub mod error;
pub mod lifecycle;
pub mod remote_sync;
pub mod restore;
pub mod snapshot_model;
pub mod snapshot_store;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use log::{info, warn};
use serde_json::Value as JsonValue;

use crate::app_response::AppResponse;
use crate::config::StoreConfig;
use crate::snapshot_model::DocumentKey;
use crate::snapshot_store::SnapshotStore;

/// Opens a snapshot store described by a JSON [`StoreConfig`].
///
/// The primary LMDB environment is created at `<path>.lmdb` and the file
/// fallback at `<path>.fallback` unless `fallback_dir` says otherwise.
///
/// # Parameters
///
/// * `config_json` - Null-terminated C string with a JSON `StoreConfig`, or
///   null for the defaults. Every field is optional.
///
/// # Returns
///
/// Returns a pointer to the [`SnapshotStore`] on success, or a null pointer on
/// failure. Release it with [`destroy_snapshot_store`].
///
/// # Safety
///
/// This function is unsafe because it:
/// - Dereferences a raw pointer without validation
/// - Returns a raw pointer that must be properly managed
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use draft_sync_core::create_snapshot_store;
///
/// let config = CString::new(r#"{"path":"drafts","feature":"weekly_plan"}"#).unwrap();
/// let store = create_snapshot_store(config.as_ptr());
/// assert!(!store.is_null());
/// ```
///
/// # Errors
///
/// Returns null pointer if:
/// - The config string contains invalid UTF-8
/// - The config is not valid JSON for a `StoreConfig`
/// - The LMDB environment or the fallback directory cannot be created
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_snapshot_store(config_json: *const c_char) -> *mut SnapshotStore {
    let config = if config_json.is_null() {
        StoreConfig::default()
    } else {
        let json = match unsafe { CStr::from_ptr(config_json).to_str() } {
            Ok(s) => s,
            Err(e) => {
                warn!("Invalid UTF-8 in store config: {e}");
                return std::ptr::null_mut();
            }
        };
        match StoreConfig::from_json(json) {
            Ok(config) => config,
            Err(e) => {
                warn!("Invalid store config: {e}");
                return std::ptr::null_mut();
            }
        }
    };

    info!("Opening snapshot store at: {}", config.path.display());
    match SnapshotStore::open(&config) {
        Ok(store) => {
            info!("✅ Snapshot store ready for feature '{}'", config.feature);
            Box::into_raw(Box::new(store))
        }
        Err(e) => {
            warn!("❌ Failed to open snapshot store: {e}");
            warn!("Attempted path: {}", config.path.display());
            std::ptr::null_mut()
        }
    }
}

/// Writes `json_ptr` (any JSON value) as the snapshot of document `key`.
///
/// The write is best-effort: when the primary store rejects it the file
/// fallback is used, and a failure of both is only logged.
///
/// # Parameters
///
/// * `store` - Pointer returned by [`create_snapshot_store`]
/// * `key` - Null-terminated C string with the document key
/// * `json_ptr` - Null-terminated C string with the draft as JSON
///
/// # Returns
///
/// Returns a JSON-formatted C string containing the operation result.
/// The returned string must be freed with [`free_response`].
///
/// # Safety
///
/// This function is unsafe because it dereferences raw pointers.
/// All parameters must be valid pointers to their respective types.
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use draft_sync_core::{create_snapshot_store, save_snapshot};
///
/// let store = create_snapshot_store(std::ptr::null());
/// let key = CString::new("2024-W03").unwrap();
/// let data = CString::new(r#"{"focus":"ship"}"#).unwrap();
/// let result = save_snapshot(store, key.as_ptr(), data.as_ptr());
/// ```
///
/// # Errors
///
/// - `BadRequest` for a null pointer or invalid UTF-8
/// - `SerializationError` if `json_ptr` is not valid JSON
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn save_snapshot(
    store: *mut SnapshotStore,
    key: *const c_char,
    json_ptr: *const c_char,
) -> *const c_char {
    let store = match unsafe { store.as_ref() } {
        Some(s) => s,
        None => return response_to_c_string(&null_store("save_snapshot")),
    };
    let key = match c_ptr_to_string(key, "key") {
        Ok(key) => DocumentKey::new(key),
        Err(err) => return err,
    };
    let json = match c_ptr_to_string(json_ptr, "JSON") {
        Ok(json) => json,
        Err(err) => return err,
    };

    let data: JsonValue = match serde_json::from_str(&json) {
        Ok(data) => data,
        Err(e) => return response_to_c_string(&AppResponse::from(e)),
    };

    store.save(&key, &data);
    response_to_c_string(&AppResponse::success(format!("Snapshot saved for {key}")))
}

/// Reads the snapshot of document `key`.
///
/// # Parameters
///
/// * `store` - Pointer returned by [`create_snapshot_store`]
/// * `key` - Null-terminated C string with the document key
///
/// # Returns
///
/// Returns a JSON-formatted C string. On success the `Ok` payload is the
/// serialized snapshot:
/// ```json
/// {"data": {...}, "timestamp": "2024-01-15T10:30:00.000Z", "version": "1.0"}
/// ```
/// The returned string must be freed with [`free_response`].
///
/// # Safety
///
/// This function is unsafe because it dereferences raw pointers.
/// Both parameters must be valid pointers to their respective types.
///
/// # Errors
///
/// - `NotFound` if there is no readable snapshot (missing, corrupt or of
///   another version)
/// - `BadRequest` for a null pointer or invalid UTF-8
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn load_snapshot(store: *mut SnapshotStore, key: *const c_char) -> *const c_char {
    let store = match unsafe { store.as_ref() } {
        Some(s) => s,
        None => return response_to_c_string(&null_store("load_snapshot")),
    };
    let key = match c_ptr_to_string(key, "key") {
        Ok(key) => DocumentKey::new(key),
        Err(err) => return err,
    };

    match store.load::<JsonValue>(&key) {
        Some(snapshot) => match serde_json::to_string(&snapshot) {
            Ok(json) => response_to_c_string(&AppResponse::Ok(json)),
            Err(e) => response_to_c_string(&AppResponse::from(e)),
        },
        None => response_to_c_string(&AppResponse::NotFound(format!(
            "No snapshot found for: {key}"
        ))),
    }
}

/// Drops the snapshot of document `key` from both backends.
///
/// # Parameters
///
/// * `store` - Pointer returned by [`create_snapshot_store`]
/// * `key` - Null-terminated C string with the document key
///
/// # Returns
///
/// Returns a JSON-formatted C string. Clearing is idempotent, so `Ok` is
/// returned whether or not a snapshot existed. The returned string must be
/// freed with [`free_response`].
///
/// # Safety
///
/// This function is unsafe because it dereferences raw pointers.
/// Both parameters must be valid pointers to their respective types.
///
/// # Errors
///
/// - `BadRequest` for a null pointer or invalid UTF-8
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn clear_snapshot(store: *mut SnapshotStore, key: *const c_char) -> *const c_char {
    let store = match unsafe { store.as_ref() } {
        Some(s) => s,
        None => return response_to_c_string(&null_store("clear_snapshot")),
    };
    let key = match c_ptr_to_string(key, "key") {
        Ok(key) => DocumentKey::new(key),
        Err(err) => return err,
    };

    store.clear(&key);
    response_to_c_string(&AppResponse::success(format!("Snapshot cleared for {key}")))
}

/// Drops every snapshot in the store.
///
/// # Parameters
///
/// * `store` - Pointer returned by [`create_snapshot_store`]
///
/// # Returns
///
/// Returns a JSON-formatted C string. The returned string must be freed with
/// [`free_response`].
///
/// # Safety
///
/// This function is unsafe because it dereferences a raw pointer.
///
/// # Errors
///
/// - `DatabaseError` if either backend could not be cleared
/// - `BadRequest` for a null store pointer
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn clear_all_snapshots(store: *mut SnapshotStore) -> *const c_char {
    let store = match unsafe { store.as_ref() } {
        Some(s) => s,
        None => return response_to_c_string(&null_store("clear_all_snapshots")),
    };

    if store.clear_all() {
        response_to_c_string(&AppResponse::success("All snapshots cleared successfully"))
    } else {
        response_to_c_string(&AppResponse::DatabaseError(
            "Some snapshots could not be cleared".to_string(),
        ))
    }
}

/// Flushes and closes both backends.
///
/// # Parameters
///
/// * `store` - Pointer returned by [`create_snapshot_store`]
///
/// # Returns
///
/// Returns a JSON-formatted C string. The returned string must be freed with
/// [`free_response`].
///
/// The handle stays valid after closing, but every later save is dropped and
/// every load reports `NotFound`. Free it with [`destroy_snapshot_store`].
///
/// # Safety
///
/// This function is unsafe because it dereferences a raw pointer.
///
/// # Errors
///
/// - `BadRequest` for a null store pointer
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_snapshot_store(store: *mut SnapshotStore) -> *const c_char {
    let store = match unsafe { store.as_ref() } {
        Some(s) => s,
        None => return response_to_c_string(&null_store("close_snapshot_store")),
    };

    store.close();
    response_to_c_string(&AppResponse::success("Snapshot store closed successfully"))
}

/// Closes and frees a handle returned by [`create_snapshot_store`].
///
/// # Parameters
///
/// * `store` - Pointer returned by [`create_snapshot_store`], or null
///
/// # Safety
///
/// This function is unsafe because it takes ownership of a raw pointer.
/// The pointer must not be used again after this call, and must not be
/// destroyed twice. A null pointer is ignored.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn destroy_snapshot_store(store: *mut SnapshotStore) {
    if store.is_null() {
        return;
    }
    let store = unsafe { Box::from_raw(store) };
    store.close();
}

/// Releases a string returned by any other function of this module.
///
/// # Parameters
///
/// * `ptr` - A response string from this library, or null
///
/// # Safety
///
/// The pointer must come from this library and must not be freed twice.
/// A null pointer is ignored.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_response(ptr: *const c_char) {
    if ptr.is_null() {
        return;
    }
    drop(unsafe { CString::from_raw(ptr as *mut c_char) });
}

fn null_store(function: &str) -> AppResponse {
    AppResponse::BadRequest(format!("Null store pointer passed to {function}"))
}

/// Serializes `response` to JSON and hands it to the caller as a C string.
///
/// Returns a null pointer if serialization or C string creation fails.
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

/// Converts a C string pointer to a Rust `String`.
///
/// On failure the `Err` side already holds the C response to return.
fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, *const c_char> {
    if ptr.is_null() {
        let error = AppResponse::BadRequest(format!("Null {field_name} pointer"));
        return Err(response_to_c_string(&error));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => {
            let error = AppResponse::BadRequest(format!("Invalid UTF-8 in {field_name}: {e}"));
            Err(response_to_c_string(&error))
        }
    }
}
