//! # Native Data Access Component
//!
//! Loads the runtime's data access component with `libloading` and drives it
//! through a small C ABI.
//!
//! ## ABI
//!
//! The module exports one function:
//!
//! ```c
//! int32_t DacCreateMemoryEnumerator(uint32_t kind,
//!                                   const DacDataTarget *target,
//!                                   DacEnumerator **out);
//! ```
//!
//! Both objects are a vtable pointer followed by their state. Return values
//! are HRESULTs: zero or positive means success, negative means failure.
//!
//! ## Safety Notes
//!
//! The data-target object handed to the module points at stack data that
//! lives until `enumerate` returns. The module must not keep it past the
//! `release` call of its enumerator. Every callback catches panics so none
//! unwinds into foreign frames.

use std::ffi::{CStr, c_char, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;
use tracing::{debug, info};

use super::{DacLoader, DacSession, DataTarget};
use crate::error::{DumpError, Result};
use crate::types::ThreadId;

/// File name of the component, without directory
pub const DAC_MODULE_NAME: &str = "libmscordaccore";

/// Exported entry point
pub const DAC_ENTRY_POINT: &[u8] = b"DacCreateMemoryEnumerator\0";

/// Success
pub const S_OK: i32 = 0;
/// Unspecified failure
pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;
/// Operation not supported
pub const E_NOTIMPL: i32 = 0x8000_4001_u32 as i32;
/// Bad argument
pub const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;

/// Receives one region: `(context, address, size)`; a negative return stops enumeration
pub type DacRegionCallback = unsafe extern "C" fn(*mut c_void, u64, u32) -> i32;

/// `DacCreateMemoryEnumerator`
pub type DacCreateMemoryEnumeratorFn =
    unsafe extern "C" fn(u32, *const DacDataTargetObject, *mut *mut DacEnumeratorObject) -> i32;

/// Functions the component may call on the target
#[repr(C)]
pub struct DacDataTargetVtbl
{
    /// `(ctx, address, buffer, size, bytes_read)`
    pub read_virtual: unsafe extern "C" fn(*mut c_void, u64, *mut u8, u32, *mut u32) -> i32,
    /// `(ctx, address, buffer, size, bytes_written)`, always fails
    pub write_virtual: unsafe extern "C" fn(*mut c_void, u64, *const u8, u32, *mut u32) -> i32,
    /// `(ctx, thread_id, context_flags, size, buffer)`
    pub get_thread_context: unsafe extern "C" fn(*mut c_void, u32, u32, u32, *mut u8) -> i32,
    /// `(ctx, module_name, base)`
    pub get_image_base: unsafe extern "C" fn(*mut c_void, *const c_char, *mut u64) -> i32,
    /// `(ctx, machine)`
    pub get_machine_type: unsafe extern "C" fn(*mut c_void, *mut u32) -> i32,
    /// `(ctx, size)`
    pub get_pointer_size: unsafe extern "C" fn(*mut c_void, *mut u32) -> i32,
}

/// Data-target object passed to the component
#[repr(C)]
pub struct DacDataTargetObject
{
    /// Function table
    pub vtbl: *const DacDataTargetVtbl,
    /// Opaque state handed back to every function
    pub context: *mut c_void,
}

/// Functions of the enumerator the component returns
#[repr(C)]
pub struct DacEnumeratorVtbl
{
    /// `(this, callback, callback_context)`
    pub enumerate_regions: unsafe extern "C" fn(*mut DacEnumeratorObject, DacRegionCallback, *mut c_void) -> i32,
    /// `(this)`
    pub release: unsafe extern "C" fn(*mut DacEnumeratorObject),
}

/// Enumerator object owned by the component
#[repr(C)]
pub struct DacEnumeratorObject
{
    /// Function table; component state follows
    pub vtbl: *const DacEnumeratorVtbl,
}

static DATA_TARGET_VTBL: DacDataTargetVtbl = DacDataTargetVtbl {
    read_virtual,
    write_virtual,
    get_thread_context,
    get_image_base,
    get_machine_type,
    get_pointer_size,
};

/// Loads the component from a fixed path
#[derive(Debug, Clone)]
pub struct LibraryDacLoader
{
    path: PathBuf,
}

impl LibraryDacLoader
{
    /// Loader for an explicit module path.
    pub fn new(path: impl Into<PathBuf>) -> Self
    {
        Self { path: path.into() }
    }

    /// Loader for `explicit`, or the component next to the running executable.
    ///
    /// ## Errors
    ///
    /// - `DacMissing`: no explicit path and the executable's directory is unknown
    pub fn locate(explicit: Option<&Path>) -> Result<Self>
    {
        if let Some(path) = explicit {
            return Ok(Self::new(path));
        }
        let exe = std::env::current_exe().map_err(|e| DumpError::DacMissing(format!("cannot locate executable: {e}")))?;
        let dir = exe
            .parent()
            .ok_or_else(|| DumpError::DacMissing(format!("{} has no parent directory", exe.display())))?;
        Ok(Self::new(dir.join(default_module_file_name())))
    }

    /// Path that will be loaded.
    pub fn path(&self) -> &Path
    {
        &self.path
    }
}

/// `libmscordaccore.so` or `libmscordaccore.dylib`.
pub fn default_module_file_name() -> String
{
    format!("{DAC_MODULE_NAME}{}", std::env::consts::DLL_SUFFIX)
}

impl DacLoader for LibraryDacLoader
{
    fn load(&self) -> Result<Box<dyn DacSession>>
    {
        let missing = |reason: String| DumpError::DacMissing(format!("{}: {reason}", self.path.display()));

        if !self.path.is_file() {
            return Err(missing("not found".to_string()));
        }

        // SAFETY: loading runs the module's initializers; the component is trusted runtime code.
        let library = unsafe { Library::new(&self.path) }.map_err(|e| missing(e.to_string()))?;

        // SAFETY: the symbol type matches the exported C signature.
        let create = unsafe {
            *library
                .get::<DacCreateMemoryEnumeratorFn>(DAC_ENTRY_POINT)
                .map_err(|e| missing(e.to_string()))?
        };

        info!("Loaded data access component {}", self.path.display());
        Ok(Box::new(LibraryDacSession {
            create,
            _library: library,
        }))
    }
}

/// A loaded module and its resolved entry point
///
/// `create` is only valid while `_library` is alive; both are dropped together.
struct LibraryDacSession
{
    create: DacCreateMemoryEnumeratorFn,
    _library: Library,
}

impl DacSession for LibraryDacSession
{
    fn enumerate(&mut self, kind: u32, target: &dyn DataTarget, sink: &mut dyn FnMut(u64, u64)) -> Result<()>
    {
        // SAFETY: `create` was resolved from the library this session keeps loaded.
        unsafe { run_enumerator(self.create, kind, target, sink) }
    }
}

/// Releases an enumerator on every exit path
struct EnumeratorGuard(*mut DacEnumeratorObject);

impl Drop for EnumeratorGuard
{
    fn drop(&mut self)
    {
        // SAFETY: the pointer came from a successful create call and is released exactly once.
        unsafe { ((*(*self.0).vtbl).release)(self.0) };
    }
}

/// Create an enumerator with `create`, run it once and release it.
///
/// ## Safety
///
/// `create` must follow the `DacCreateMemoryEnumerator` contract.
pub unsafe fn run_enumerator(
    create: DacCreateMemoryEnumeratorFn,
    kind: u32,
    target: &dyn DataTarget,
    sink: &mut dyn FnMut(u64, u64),
) -> Result<()>
{
    let mut target_ref: &dyn DataTarget = target;
    let object = DacDataTargetObject {
        vtbl: &DATA_TARGET_VTBL,
        context: (&mut target_ref as *mut &dyn DataTarget).cast(),
    };

    let mut enumerator: *mut DacEnumeratorObject = ptr::null_mut();
    // SAFETY: `object` outlives the enumerator, which is released before we return.
    let hr = unsafe { create(kind, &object, &mut enumerator) };
    if hr < 0 {
        return Err(DumpError::DacFailed(format!("DacCreateMemoryEnumerator failed: 0x{:08x}", hr as u32)));
    }
    if enumerator.is_null() {
        return Err(DumpError::DacFailed("DacCreateMemoryEnumerator returned no enumerator".to_string()));
    }
    let guard = EnumeratorGuard(enumerator);

    let mut sink_ref: &mut dyn FnMut(u64, u64) = sink;
    let callback_context = (&mut sink_ref as *mut &mut dyn FnMut(u64, u64)).cast::<c_void>();

    // SAFETY: the enumerator is live until `guard` drops.
    let hr = unsafe { ((*(*guard.0).vtbl).enumerate_regions)(guard.0, region_callback, callback_context) };
    if hr < 0 {
        return Err(DumpError::DacFailed(format!("memory enumeration failed: 0x{:08x}", hr as u32)));
    }
    debug!("Data access component enumeration finished");
    Ok(())
}

/// Recover the data target behind a callback context.
///
/// ## Safety
///
/// `context` must be the `context` field of an object built by [`run_enumerator`].
unsafe fn target_from<'a>(context: *mut c_void) -> &'a dyn DataTarget
{
    unsafe { *(context as *const &dyn DataTarget) }
}

fn guarded(f: impl FnOnce() -> i32) -> i32
{
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(E_FAIL)
}

unsafe extern "C" fn region_callback(context: *mut c_void, address: u64, size: u32) -> i32
{
    guarded(|| {
        // SAFETY: `context` is the sink pointer built in `run_enumerator`.
        let sink = unsafe { &mut *(context as *mut &mut dyn FnMut(u64, u64)) };
        sink(address, u64::from(size));
        S_OK
    })
}

unsafe extern "C" fn read_virtual(context: *mut c_void, address: u64, buffer: *mut u8, size: u32, read: *mut u32) -> i32
{
    if buffer.is_null() {
        return E_INVALIDARG;
    }
    guarded(|| {
        // SAFETY: the component passes a writable buffer of `size` bytes.
        let buffer = unsafe { std::slice::from_raw_parts_mut(buffer, size as usize) };
        match unsafe { target_from(context) }.read_virtual(address, buffer) {
            Ok(count) => {
                if !read.is_null() {
                    unsafe { *read = count as u32 };
                }
                S_OK
            }
            Err(_) => E_FAIL,
        }
    })
}

unsafe extern "C" fn write_virtual(context: *mut c_void, address: u64, buffer: *const u8, size: u32, written: *mut u32) -> i32
{
    if !written.is_null() {
        unsafe { *written = 0 };
    }
    guarded(|| {
        let data = if buffer.is_null() {
            &[][..]
        } else {
            unsafe { std::slice::from_raw_parts(buffer, size as usize) }
        };
        match unsafe { target_from(context) }.write_virtual(address, data) {
            Ok(()) => S_OK,
            Err(_) => E_NOTIMPL,
        }
    })
}

unsafe extern "C" fn get_thread_context(context: *mut c_void, tid: u32, _flags: u32, size: u32, buffer: *mut u8) -> i32
{
    if buffer.is_null() {
        return E_INVALIDARG;
    }
    guarded(|| {
        let Ok(bytes) = (unsafe { target_from(context) }).thread_context(ThreadId(u64::from(tid))) else {
            return E_FAIL;
        };
        if (size as usize) < bytes.len() {
            return E_INVALIDARG;
        }
        let out = unsafe { std::slice::from_raw_parts_mut(buffer, size as usize) };
        out[..bytes.len()].copy_from_slice(&bytes);
        out[bytes.len()..].fill(0);
        S_OK
    })
}

unsafe extern "C" fn get_image_base(context: *mut c_void, name: *const c_char, base: *mut u64) -> i32
{
    if name.is_null() || base.is_null() {
        return E_INVALIDARG;
    }
    guarded(|| {
        let name = unsafe { CStr::from_ptr(name) }.to_string_lossy();
        match unsafe { target_from(context) }.image_base(&name) {
            Some(address) => {
                unsafe { *base = address };
                S_OK
            }
            None => E_FAIL,
        }
    })
}

unsafe extern "C" fn get_machine_type(context: *mut c_void, machine: *mut u32) -> i32
{
    if machine.is_null() {
        return E_INVALIDARG;
    }
    guarded(|| {
        unsafe { *machine = u32::from(target_from(context).machine_type()) };
        S_OK
    })
}

unsafe extern "C" fn get_pointer_size(context: *mut c_void, size: *mut u32) -> i32
{
    if size.is_null() {
        return E_INVALIDARG;
    }
    guarded(|| {
        unsafe { *size = target_from(context).pointer_size() };
        S_OK
    })
}

#[cfg(test)]
mod tests
{
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Fake;

    impl DataTarget for Fake
    {
        fn read_virtual(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
        {
            buffer.fill((address & 0xff) as u8);
            Ok(buffer.len())
        }

        fn thread_context(&self, _tid: ThreadId) -> Result<Vec<u8>>
        {
            Ok(vec![1, 2, 3, 4])
        }

        fn image_base(&self, name: &str) -> Option<u64>
        {
            (name == "libcoreclr.so").then_some(0x7f00_0000_0000)
        }

        fn machine_type(&self) -> u16
        {
            super::super::IMAGE_FILE_MACHINE_AMD64
        }

        fn pointer_size(&self) -> u32
        {
            8
        }
    }

    static RELEASED: AtomicUsize = AtomicUsize::new(0);

    /// Enumerator that exercises every data-target function, then reports two ranges.
    #[repr(C)]
    struct TestEnumerator
    {
        base: DacEnumeratorObject,
        target: *const DacDataTargetObject,
    }

    static TEST_VTBL: DacEnumeratorVtbl = DacEnumeratorVtbl {
        enumerate_regions: test_enumerate,
        release: test_release,
    };

    unsafe extern "C" fn test_enumerate(this: *mut DacEnumeratorObject, callback: DacRegionCallback, ctx: *mut c_void) -> i32
    {
        unsafe {
            let target = &*(*(this as *mut TestEnumerator)).target;
            let vtbl = &*target.vtbl;

            let mut byte = 0u8;
            let mut read = 0u32;
            assert_eq!((vtbl.read_virtual)(target.context, 0x1042, &mut byte, 1, &mut read), S_OK);
            assert_eq!((byte, read), (0x42, 1));

            let mut base = 0u64;
            assert_eq!((vtbl.get_image_base)(target.context, c"libcoreclr.so".as_ptr(), &mut base), S_OK);
            assert_eq!(base, 0x7f00_0000_0000);
            assert_eq!((vtbl.get_image_base)(target.context, c"nope".as_ptr(), &mut base), E_FAIL);

            let mut context = [0xffu8; 8];
            assert_eq!((vtbl.get_thread_context)(target.context, 1, 0, 8, context.as_mut_ptr()), S_OK);
            assert_eq!(context, [1, 2, 3, 4, 0, 0, 0, 0]);
            assert_eq!((vtbl.get_thread_context)(target.context, 1, 0, 2, context.as_mut_ptr()), E_INVALIDARG);

            let mut machine = 0u32;
            assert_eq!((vtbl.get_machine_type)(target.context, &mut machine), S_OK);
            assert_eq!(machine, 0x8664);

            let mut written = 9u32;
            assert!((vtbl.write_virtual)(target.context, 0x1000, &byte, 1, &mut written) < 0);
            assert_eq!(written, 0);

            callback(ctx, 0x1000, 0x10);
            callback(ctx, 0x5000, 0x2000);
        }
        S_OK
    }

    unsafe extern "C" fn test_release(this: *mut DacEnumeratorObject)
    {
        RELEASED.fetch_add(1, Ordering::SeqCst);
        drop(unsafe { Box::from_raw(this as *mut TestEnumerator) });
    }

    unsafe extern "C" fn test_create(kind: u32, target: *const DacDataTargetObject, out: *mut *mut DacEnumeratorObject) -> i32
    {
        if kind == 0 {
            return E_FAIL;
        }
        let enumerator = Box::new(TestEnumerator {
            base: DacEnumeratorObject { vtbl: &TEST_VTBL },
            target,
        });
        unsafe { *out = Box::into_raw(enumerator).cast() };
        S_OK
    }

    #[test]
    fn test_enumerator_round_trip_through_abi()
    {
        let mut seen = Vec::new();
        let before = RELEASED.load(Ordering::SeqCst);
        unsafe { run_enumerator(test_create, 0x1205, &Fake, &mut |a, s| seen.push((a, s))) }.unwrap();

        assert_eq!(seen, vec![(0x1000, 0x10), (0x5000, 0x2000)]);
        assert_eq!(RELEASED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_create_failure_is_dac_failed()
    {
        let err = unsafe { run_enumerator(test_create, 0, &Fake, &mut |_, _| {}) }.unwrap_err();
        assert!(matches!(err, DumpError::DacFailed(_)));
    }

    #[test]
    fn test_missing_module_is_reported()
    {
        let loader = LibraryDacLoader::new("/nonexistent/libmscordaccore.so");
        let err = loader.load().err().unwrap();
        assert!(matches!(err, DumpError::DacMissing(_)));
    }

    #[test]
    fn test_default_location_is_next_to_executable()
    {
        let loader = LibraryDacLoader::locate(None).unwrap();
        let exe_dir = std::env::current_exe().unwrap().parent().unwrap().to_path_buf();
        assert_eq!(loader.path().parent(), Some(exe_dir.as_path()));
        assert!(loader.path().to_string_lossy().contains(DAC_MODULE_NAME));
    }
}
