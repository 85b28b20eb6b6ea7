//! C symbols for embedding the host surface in a Rust process.
//!
//! Every symbol forwards to the process-wide [`HostApi`] installed with
//! [`install`]; an [`InMemoryHost`] is used when nothing was installed.
//! Failures cannot be reported across the C boundary and are logged instead.

#![allow(non_snake_case)]

use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char, c_int};
use std::sync::{Arc, OnceLock};

use super::{HostApi, HostError, InMemoryHost};

static HOST: OnceLock<Arc<dyn HostApi>> = OnceLock::new();

thread_local! {
    static LAST_VALUE: RefCell<CString> = RefCell::new(CString::default());
}

/// Installs the host backing the exported symbols. Only the first call wins.
pub fn install(host: Arc<dyn HostApi>) -> Result<(), HostError> {
    HOST.set(host).map_err(|_| HostError::AlreadyInstalled)
}

pub fn installed() -> &'static Arc<dyn HostApi> {
    HOST.get_or_init(|| Arc::new(InMemoryHost::new()))
}

unsafe fn read_arg(ptr: *const c_char, argument: &str) -> Option<String> {
    if ptr.is_null() {
        tracing::warn!(target: "coprocess", argument, "null argument passed to host call");
        return None;
    }
    Some(
        unsafe { CStr::from_ptr(ptr) }
            .to_string_lossy()
            .into_owned(),
    )
}

fn report(call: &str, result: Result<(), HostError>) {
    if let Err(err) = result {
        tracing::warn!(target: "coprocess", call, error = %err, "host call failed");
    }
}

/// # Safety
/// `message` and `level` must be null or valid NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn CoProcessLog(message: *const c_char, level: *const c_char) {
    let Some(message) = (unsafe { read_arg(message, "message") }) else {
        return;
    };
    let level = unsafe { read_arg(level, "level") }.unwrap_or_default();
    report("CoProcessLog", installed().log(&message, &level));
}

/// Returns the stored value, or an empty string when the key is missing.
///
/// # Safety
/// `key` must be null or a valid NUL-terminated string. The returned pointer
/// stays valid until the next `TykGetData` call on the same thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn TykGetData(key: *const c_char) -> *const c_char {
    let value = match unsafe { read_arg(key, "key") } {
        Some(key) => match installed().get_data(&key) {
            Ok(value) => value.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(target: "coprocess", error = %err, "TykGetData failed");
                String::new()
            }
        },
        None => String::new(),
    };
    let value = CString::new(value).unwrap_or_else(|_| {
        tracing::warn!(target: "coprocess", "stored value contains a NUL byte");
        CString::default()
    });
    LAST_VALUE.with(|slot| {
        *slot.borrow_mut() = value;
        slot.borrow().as_ptr()
    })
}

/// # Safety
/// `key` and `value` must be null or valid NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn TykStoreData(key: *const c_char, value: *const c_char, ttl: c_int) {
    let (Some(key), Some(value)) = (unsafe { read_arg(key, "key") }, unsafe {
        read_arg(value, "value")
    }) else {
        return;
    };
    report("TykStoreData", installed().store_data(&key, &value, ttl));
}

/// # Safety
/// `name` and `payload` must be null or valid NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn TykTriggerEvent(name: *const c_char, payload: *const c_char) {
    let Some(name) = (unsafe { read_arg(name, "name") }) else {
        return;
    };
    let payload = unsafe { read_arg(payload, "payload") }.unwrap_or_default();
    report("TykTriggerEvent", installed().trigger_event(&name, &payload));
}
