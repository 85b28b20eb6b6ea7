//! Binding to the host symbols linked into the running process.

use std::ffi::{CStr, CString, c_char, c_int};

use super::{HostApi, HostError};

pub type LogFn = unsafe extern "C" fn(message: *const c_char, level: *const c_char);
pub type GetDataFn = unsafe extern "C" fn(key: *const c_char) -> *const c_char;
pub type StoreDataFn = unsafe extern "C" fn(key: *const c_char, value: *const c_char, ttl: c_int);
pub type TriggerEventFn = unsafe extern "C" fn(name: *const c_char, payload: *const c_char);

pub const LOG_SYMBOL: &CStr = c"CoProcessLog";
pub const GET_DATA_SYMBOL: &CStr = c"TykGetData";
pub const STORE_DATA_SYMBOL: &CStr = c"TykStoreData";
pub const TRIGGER_EVENT_SYMBOL: &CStr = c"TykTriggerEvent";

/// Function pointers for the host-call surface.
#[derive(Debug, Clone, Copy)]
pub struct HostSymbols {
    pub log: LogFn,
    pub get_data: GetDataFn,
    pub store_data: StoreDataFn,
    pub trigger_event: TriggerEventFn,
}

impl HostSymbols {
    /// Looks the symbols up in the process's global symbol table.
    #[cfg(unix)]
    pub fn resolve() -> Result<Self, HostError> {
        // SAFETY: the symbol types match the C signatures the gateway exports.
        unsafe {
            Ok(Self {
                log: resolve_symbol(LOG_SYMBOL)?,
                get_data: resolve_symbol(GET_DATA_SYMBOL)?,
                store_data: resolve_symbol(STORE_DATA_SYMBOL)?,
                trigger_event: resolve_symbol(TRIGGER_EVENT_SYMBOL)?,
            })
        }
    }

    #[cfg(not(unix))]
    pub fn resolve() -> Result<Self, HostError> {
        Err(HostError::Unsupported)
    }

    /// The symbols this crate exports itself, see [`super::exports`].
    pub fn exported() -> Self {
        Self {
            log: super::exports::CoProcessLog,
            get_data: super::exports::TykGetData,
            store_data: super::exports::TykStoreData,
            trigger_event: super::exports::TykTriggerEvent,
        }
    }
}

#[cfg(unix)]
unsafe fn resolve_symbol<T: Copy>(name: &CStr) -> Result<T, HostError> {
    debug_assert_eq!(
        std::mem::size_of::<T>(),
        std::mem::size_of::<*mut libc::c_void>()
    );
    let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if ptr.is_null() {
        return Err(HostError::SymbolNotFound(
            name.to_string_lossy().into_owned(),
        ));
    }
    Ok(unsafe { std::mem::transmute_copy::<*mut libc::c_void, T>(&ptr) })
}

/// Forwards every call to the host symbols, marshalling arguments as
/// NUL-terminated strings.
#[derive(Debug, Clone, Copy)]
pub struct LinkedHost {
    symbols: HostSymbols,
}

impl LinkedHost {
    pub fn load() -> Result<Self, HostError> {
        HostSymbols::resolve().map(Self::new)
    }

    pub fn new(symbols: HostSymbols) -> Self {
        Self { symbols }
    }
}

fn to_cstring(value: &str, argument: &'static str) -> Result<CString, HostError> {
    CString::new(value).map_err(|_| HostError::InteriorNul { argument })
}

impl HostApi for LinkedHost {
    fn log(&self, message: &str, level: &str) -> Result<(), HostError> {
        let message = to_cstring(message, "message")?;
        let level = to_cstring(level, "level")?;
        unsafe { (self.symbols.log)(message.as_ptr(), level.as_ptr()) };
        Ok(())
    }

    fn get_data(&self, key: &str) -> Result<Option<String>, HostError> {
        let key = to_cstring(key, "key")?;
        let value = unsafe { (self.symbols.get_data)(key.as_ptr()) };
        if value.is_null() {
            return Ok(None);
        }
        // The host owns the returned buffer; copy it out immediately.
        let value = unsafe { CStr::from_ptr(value) }
            .to_str()
            .map_err(|_| HostError::InvalidUtf8 { argument: "value" })?;
        if value.is_empty() {
            return Ok(None);
        }
        Ok(Some(value.to_string()))
    }

    fn store_data(&self, key: &str, value: &str, ttl: i32) -> Result<(), HostError> {
        let key = to_cstring(key, "key")?;
        let value = to_cstring(value, "value")?;
        unsafe { (self.symbols.store_data)(key.as_ptr(), value.as_ptr(), ttl) };
        Ok(())
    }

    fn trigger_event(&self, name: &str, payload: &str) -> Result<(), HostError> {
        let name = to_cstring(name, "name")?;
        let payload = to_cstring(payload, "payload")?;
        unsafe { (self.symbols.trigger_event)(name.as_ptr(), payload.as_ptr()) };
        Ok(())
    }
}
