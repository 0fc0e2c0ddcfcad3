//! Registration of the compressed store as a SQLite virtual file system.
//!
//! The shim follows SQLite's documented VFS contract. Main database files
//! are backed by a [`PageStore`]; everything else the engine opens through
//! this VFS (rollback journals, temporary files) passes through to the
//! process default VFS unchanged, since those files are transient and
//! compressing them would only add latency.
//!
//! The store reads its tuning from URI query parameters on the database
//! filename (`outer_page_size`, `zstd_level`, `threads`), which is how the
//! connection opener hands configuration down to the storage layer.
//!
//! Byte-range locking is a no-op: connections are expected to coordinate
//! at the application level, and each connection owns its store handle.
//! The shim advertises version-1 I/O methods, so the engine never attempts
//! WAL mode on a compressed database.

use super::{PageStore, StoreParams, CHUNK_SIZES, DEFAULT_CHUNK_SIZE, DEFAULT_ZSTD_LEVEL, VFS_NAME};

use std::ffi::{c_char, c_int, c_void, CStr};
use std::fs;
use std::mem::size_of;
use std::ptr;
use std::sync::OnceLock;

use rusqlite::ffi;

use tracing::debug;

//-----------------------------------------------------------------------------

// The file handle SQLite allocates for us: the required base struct,
// followed by a pointer to our state. SQLite allocates szOsFile bytes and
// expects pMethods to be initialized by xOpen, even on failure.
#[repr(C)]
struct ShimFile {
    base: ffi::sqlite3_file,
    state: *mut FileState,
}

enum FileState {
    // A compressed main database file.
    Store { store: PageStore, readonly: bool },
    // A passthrough file owned by the default VFS. The buffer holds the
    // default VFS's own file structure (szOsFile bytes, pointer-aligned).
    Inner { buf: Vec<u64> },
}

impl FileState {
    fn inner_file(&mut self) -> *mut ffi::sqlite3_file {
        match self {
            FileState::Inner { buf } => buf.as_mut_ptr() as *mut ffi::sqlite3_file,
            FileState::Store { .. } => ptr::null_mut(),
        }
    }
}

unsafe fn shim_state(file: *mut ffi::sqlite3_file) -> *mut FileState {
    (*(file as *mut ShimFile)).state
}

unsafe fn default_vfs_of(vfs: *mut ffi::sqlite3_vfs) -> *mut ffi::sqlite3_vfs {
    (*vfs).pAppData as *mut ffi::sqlite3_vfs
}

//-----------------------------------------------------------------------------

// I/O methods. One table serves both file kinds; each method dispatches on
// the state.

static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(shim_close),
    xRead: Some(shim_read),
    xWrite: Some(shim_write),
    xTruncate: Some(shim_truncate),
    xSync: Some(shim_sync),
    xFileSize: Some(shim_file_size),
    xLock: Some(shim_lock),
    xUnlock: Some(shim_lock),
    xCheckReservedLock: Some(shim_check_reserved_lock),
    xFileControl: Some(shim_file_control),
    xSectorSize: Some(shim_sector_size),
    xDeviceCharacteristics: Some(shim_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

unsafe extern "C" fn shim_close(file: *mut ffi::sqlite3_file) -> c_int {
    let state = shim_state(file);
    if state.is_null() {
        return ffi::SQLITE_OK;
    }
    let mut state = Box::from_raw(state);
    let rc = match &mut *state {
        FileState::Store { store, .. } => {
            // Under relaxed synchronous settings the engine may close with
            // uncommitted writes; commit them now.
            if store.has_dirty() && store.sync().is_err() {
                ffi::SQLITE_IOERR_FSYNC
            } else {
                ffi::SQLITE_OK
            }
        }
        inner_state @ FileState::Inner { .. } => {
            let inner = inner_state.inner_file();
            match (*(*inner).pMethods).xClose {
                Some(close) => close(inner),
                None => ffi::SQLITE_OK,
            }
        }
    };
    (*(file as *mut ShimFile)).state = ptr::null_mut();
    rc
}

unsafe extern "C" fn shim_read(
    file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    match &mut *shim_state(file) {
        FileState::Store { store, .. } => {
            let out = std::slice::from_raw_parts_mut(buf as *mut u8, amt as usize);
            let offset = offset as u64;
            let logical = store.logical_size();
            if offset >= logical {
                out.fill(0);
                return ffi::SQLITE_IOERR_SHORT_READ;
            }
            let avail = ((logical - offset) as usize).min(out.len());
            if store.read_at(offset, &mut out[..avail]).is_err() {
                return ffi::SQLITE_IOERR_READ;
            }
            if avail < out.len() {
                out[avail..].fill(0);
                return ffi::SQLITE_IOERR_SHORT_READ;
            }
            ffi::SQLITE_OK
        }
        state @ FileState::Inner { .. } => {
            let inner = state.inner_file();
            match (*(*inner).pMethods).xRead {
                Some(read) => read(inner, buf, amt, offset),
                None => ffi::SQLITE_IOERR_READ,
            }
        }
    }
}

unsafe extern "C" fn shim_write(
    file: *mut ffi::sqlite3_file,
    buf: *const c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    match &mut *shim_state(file) {
        FileState::Store { store, readonly } => {
            if *readonly {
                return ffi::SQLITE_READONLY;
            }
            let data = std::slice::from_raw_parts(buf as *const u8, amt as usize);
            match store.write_at(offset as u64, data) {
                Ok(()) => ffi::SQLITE_OK,
                Err(_) => ffi::SQLITE_IOERR_WRITE,
            }
        }
        state @ FileState::Inner { .. } => {
            let inner = state.inner_file();
            match (*(*inner).pMethods).xWrite {
                Some(write) => write(inner, buf, amt, offset),
                None => ffi::SQLITE_IOERR_WRITE,
            }
        }
    }
}

unsafe extern "C" fn shim_truncate(file: *mut ffi::sqlite3_file, size: ffi::sqlite3_int64) -> c_int {
    match &mut *shim_state(file) {
        FileState::Store { store, .. } => match store.truncate(size as u64) {
            Ok(()) => ffi::SQLITE_OK,
            Err(_) => ffi::SQLITE_IOERR_TRUNCATE,
        },
        state @ FileState::Inner { .. } => {
            let inner = state.inner_file();
            match (*(*inner).pMethods).xTruncate {
                Some(truncate) => truncate(inner, size),
                None => ffi::SQLITE_IOERR_TRUNCATE,
            }
        }
    }
}

unsafe extern "C" fn shim_sync(file: *mut ffi::sqlite3_file, flags: c_int) -> c_int {
    match &mut *shim_state(file) {
        FileState::Store { store, .. } => match store.sync() {
            Ok(()) => ffi::SQLITE_OK,
            Err(_) => ffi::SQLITE_IOERR_FSYNC,
        },
        state @ FileState::Inner { .. } => {
            let inner = state.inner_file();
            match (*(*inner).pMethods).xSync {
                Some(sync) => sync(inner, flags),
                None => ffi::SQLITE_IOERR_FSYNC,
            }
        }
    }
}

unsafe extern "C" fn shim_file_size(
    file: *mut ffi::sqlite3_file,
    size: *mut ffi::sqlite3_int64,
) -> c_int {
    match &mut *shim_state(file) {
        FileState::Store { store, .. } => {
            *size = store.logical_size() as ffi::sqlite3_int64;
            ffi::SQLITE_OK
        }
        state @ FileState::Inner { .. } => {
            let inner = state.inner_file();
            match (*(*inner).pMethods).xFileSize {
                Some(file_size) => file_size(inner, size),
                None => ffi::SQLITE_IOERR,
            }
        }
    }
}

unsafe extern "C" fn shim_lock(file: *mut ffi::sqlite3_file, level: c_int) -> c_int {
    match &mut *shim_state(file) {
        FileState::Store { .. } => ffi::SQLITE_OK,
        state @ FileState::Inner { .. } => {
            let inner = state.inner_file();
            match (*(*inner).pMethods).xLock {
                Some(lock) => lock(inner, level),
                None => ffi::SQLITE_OK,
            }
        }
    }
}

unsafe extern "C" fn shim_check_reserved_lock(
    file: *mut ffi::sqlite3_file,
    result: *mut c_int,
) -> c_int {
    match &mut *shim_state(file) {
        FileState::Store { .. } => {
            *result = 0;
            ffi::SQLITE_OK
        }
        state @ FileState::Inner { .. } => {
            let inner = state.inner_file();
            match (*(*inner).pMethods).xCheckReservedLock {
                Some(check) => check(inner, result),
                None => {
                    *result = 0;
                    ffi::SQLITE_OK
                }
            }
        }
    }
}

unsafe extern "C" fn shim_file_control(
    file: *mut ffi::sqlite3_file,
    op: c_int,
    arg: *mut c_void,
) -> c_int {
    match &mut *shim_state(file) {
        FileState::Store { .. } => ffi::SQLITE_NOTFOUND,
        state @ FileState::Inner { .. } => {
            let inner = state.inner_file();
            match (*(*inner).pMethods).xFileControl {
                Some(control) => control(inner, op, arg),
                None => ffi::SQLITE_NOTFOUND,
            }
        }
    }
}

unsafe extern "C" fn shim_sector_size(file: *mut ffi::sqlite3_file) -> c_int {
    match &mut *shim_state(file) {
        FileState::Store { .. } => 4096,
        state @ FileState::Inner { .. } => {
            let inner = state.inner_file();
            match (*(*inner).pMethods).xSectorSize {
                Some(sector_size) => sector_size(inner),
                None => 4096,
            }
        }
    }
}

unsafe extern "C" fn shim_device_characteristics(file: *mut ffi::sqlite3_file) -> c_int {
    match &mut *shim_state(file) {
        FileState::Store { .. } => 0,
        state @ FileState::Inner { .. } => {
            let inner = state.inner_file();
            match (*(*inner).pMethods).xDeviceCharacteristics {
                Some(characteristics) => characteristics(inner),
                None => 0,
            }
        }
    }
}

//-----------------------------------------------------------------------------

// VFS methods.

unsafe extern "C" fn vfs_open(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    out_flags: *mut c_int,
) -> c_int {
    let shim = file as *mut ShimFile;
    (*shim).base.pMethods = ptr::null();
    (*shim).state = ptr::null_mut();

    if flags & ffi::SQLITE_OPEN_MAIN_DB != 0 && !name.is_null() {
        let path = match CStr::from_ptr(name).to_str() {
            Ok(path) => path,
            Err(_) => return ffi::SQLITE_CANTOPEN,
        };
        // Tuning keys from the URI; the opener validates their domains,
        // but foreign callers may pass anything, so clamp here.
        let chunk_size =
            ffi::sqlite3_uri_int64(name, c"outer_page_size".as_ptr(), DEFAULT_CHUNK_SIZE as i64);
        let zstd_level =
            ffi::sqlite3_uri_int64(name, c"zstd_level".as_ptr(), DEFAULT_ZSTD_LEVEL as i64);
        let threads = ffi::sqlite3_uri_int64(name, c"threads".as_ptr(), 1);
        let params = StoreParams {
            chunk_size: if CHUNK_SIZES.contains(&(chunk_size as usize)) {
                chunk_size as usize
            } else {
                DEFAULT_CHUNK_SIZE
            },
            zstd_level: (zstd_level as i32).clamp(-5, 22),
            threads: threads.clamp(1, 64) as usize,
        };

        let readonly = flags & ffi::SQLITE_OPEN_READONLY != 0;
        let create = flags & ffi::SQLITE_OPEN_CREATE != 0;
        let exists = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        let result = if exists {
            PageStore::open(path, !readonly, &params)
        } else if create {
            PageStore::create(path, &params)
        } else {
            debug!(path, "refusing to open a missing database without create");
            return ffi::SQLITE_CANTOPEN;
        };
        match result {
            Ok(store) => {
                let state = Box::new(FileState::Store { store, readonly });
                (*shim).state = Box::into_raw(state);
                (*shim).base.pMethods = &IO_METHODS;
                if !out_flags.is_null() {
                    *out_flags = flags;
                }
                ffi::SQLITE_OK
            }
            Err(error) => {
                debug!(path, %error, "cannot open compressed database");
                ffi::SQLITE_CANTOPEN
            }
        }
    } else {
        // Not a main database: hand the file to the default VFS and
        // forward all I/O to it.
        let default = default_vfs_of(vfs);
        let words = ((*default).szOsFile as usize).div_ceil(size_of::<u64>());
        let mut state = Box::new(FileState::Inner { buf: vec![0u64; words] });
        let inner = state.inner_file();
        let rc = match (*default).xOpen {
            Some(open) => open(default, name, inner, flags, out_flags),
            None => ffi::SQLITE_CANTOPEN,
        };
        if rc != ffi::SQLITE_OK {
            return rc;
        }
        (*shim).state = Box::into_raw(state);
        (*shim).base.pMethods = &IO_METHODS;
        rc
    }
}

unsafe extern "C" fn vfs_delete(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    sync_dir: c_int,
) -> c_int {
    let default = default_vfs_of(vfs);
    match (*default).xDelete {
        Some(delete) => delete(default, name, sync_dir),
        None => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn vfs_access(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    flags: c_int,
    result: *mut c_int,
) -> c_int {
    let default = default_vfs_of(vfs);
    match (*default).xAccess {
        Some(access) => access(default, name, flags, result),
        None => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn vfs_full_pathname(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    out_len: c_int,
    out: *mut c_char,
) -> c_int {
    let default = default_vfs_of(vfs);
    match (*default).xFullPathname {
        Some(full_pathname) => full_pathname(default, name, out_len, out),
        None => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn vfs_randomness(
    vfs: *mut ffi::sqlite3_vfs,
    len: c_int,
    out: *mut c_char,
) -> c_int {
    let default = default_vfs_of(vfs);
    match (*default).xRandomness {
        Some(randomness) => randomness(default, len, out),
        None => 0,
    }
}

unsafe extern "C" fn vfs_sleep(vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    let default = default_vfs_of(vfs);
    match (*default).xSleep {
        Some(sleep) => sleep(default, microseconds),
        None => 0,
    }
}

unsafe extern "C" fn vfs_current_time(vfs: *mut ffi::sqlite3_vfs, out: *mut f64) -> c_int {
    let default = default_vfs_of(vfs);
    match (*default).xCurrentTime {
        Some(current_time) => current_time(default, out),
        None => ffi::SQLITE_ERROR,
    }
}

//-----------------------------------------------------------------------------

static REGISTRATION: OnceLock<c_int> = OnceLock::new();

/// Registers the compressed VFS with the host engine under
/// [`VFS_NAME`](super::VFS_NAME).
///
/// Registration is process-wide and happens once; further calls are cheap.
/// The VFS is not made the default: callers opt in per connection through
/// the `vfs=` URI parameter, which the connection opener does.
pub fn register() -> std::io::Result<()> {
    let rc = *REGISTRATION.get_or_init(|| unsafe { register_impl() });
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "registering the {} VFS failed with SQLite error code {}",
            VFS_NAME, rc
        )))
    }
}

unsafe fn register_impl() -> c_int {
    let default = ffi::sqlite3_vfs_find(ptr::null());
    if default.is_null() {
        return ffi::SQLITE_ERROR;
    }
    let version = if (*default).xCurrentTimeInt64.is_some() { 2 } else { 1 };
    let vfs = Box::new(ffi::sqlite3_vfs {
        iVersion: version,
        szOsFile: size_of::<ShimFile>() as c_int,
        mxPathname: (*default).mxPathname,
        pNext: ptr::null_mut(),
        zName: c"zstd".as_ptr(),
        pAppData: default as *mut c_void,
        xOpen: Some(vfs_open),
        xDelete: Some(vfs_delete),
        xAccess: Some(vfs_access),
        xFullPathname: Some(vfs_full_pathname),
        // The loadable-extension hooks do not consult VFS state; reuse the
        // default implementations directly.
        xDlOpen: (*default).xDlOpen,
        xDlError: (*default).xDlError,
        xDlSym: (*default).xDlSym,
        xDlClose: (*default).xDlClose,
        xRandomness: Some(vfs_randomness),
        xSleep: Some(vfs_sleep),
        xCurrentTime: Some(vfs_current_time),
        xGetLastError: (*default).xGetLastError,
        xCurrentTimeInt64: (*default).xCurrentTimeInt64,
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    });
    let rc = ffi::sqlite3_vfs_register(Box::into_raw(vfs), 0);
    if rc == ffi::SQLITE_OK {
        debug!(name = VFS_NAME, "registered compressed VFS");
    }
    rc
}
