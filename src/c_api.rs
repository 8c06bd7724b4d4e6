//! C API for the write coordinator.
//!
//! The handle wraps a coordinator paired with file storage. The C caller does
//! the value gathering itself and uses `cubew_append_row`/`cubew_flush` to
//! persist the rows the coordinator assigns to it. The master rank also
//! records metric metadata with `cubew_define_metric` and
//! `cubew_set_known_cnodes`. Null handles are rejected with the error value of
//! each call.
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};

use crate::coordinator::WriteCoordinator;
use crate::storage::file::{FileStorage, FileStorageFactory};
use crate::storage::{ReportIdentity, ReportStorage};
use crate::Result;

type Handle = WriteCoordinator<FileStorage>;

/// Borrow the coordinator behind `ptr`, `None` for a null handle.
unsafe fn handle<'a>(ptr: *mut c_void) -> Option<&'a mut Handle> {
    let coord = (ptr as *mut Handle).as_mut();
    if coord.is_none() {
        eprintln!("cube_writer: called with a null coordinator handle");
    }
    coord
}

/// View `len` elements at `data`, `None` when `data` is null but `len` is not 0.
unsafe fn slice_arg<'a, T>(data: *const T, len: usize) -> Option<&'a [T]> {
    if len == 0 {
        Some(&[][..])
    } else if data.is_null() {
        eprintln!("cube_writer: null array of {} elements", len);
        None
    } else {
        Some(std::slice::from_raw_parts(data, len))
    }
}

/// Map a result to 0 on success and -1 on failure, logging the error.
fn status(op: &str, result: Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(op, error = %err, "cube writer call failed");
            -1
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_coordinator_create(
    rank: c_int,
    nprocs: c_int,
    writers: c_int,
    dir: *const c_char,
    name: *const c_char,
    compression: c_int,
) -> *mut c_void {
    if rank < 0 || nprocs < 0 || dir.is_null() || name.is_null() {
        eprintln!("cube_writer: invalid arguments to cubew_coordinator_create");
        return std::ptr::null_mut();
    }
    let dir = CStr::from_ptr(dir).to_string_lossy().to_string();
    let name = CStr::from_ptr(name).to_string_lossy().to_string();
    let identity = ReportIdentity::new(dir, name);
    let result = WriteCoordinator::create(
        rank as usize,
        nprocs as usize,
        writers.max(0) as usize,
        &identity,
        compression != 0,
        &FileStorageFactory,
    );
    match result {
        Ok(coord) => Box::into_raw(Box::new(coord)) as *mut c_void,
        Err(err) => {
            eprintln!("cube_writer: failed to create coordinator for rank {}: {}", rank, err);
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_configure_metric(ptr: *mut c_void, array_size: u64) {
    if let Some(coord) = handle(ptr) {
        coord.configure_metric(array_size);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_reset_round(ptr: *mut c_void) {
    if let Some(coord) = handle(ptr) {
        coord.reset_round();
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_is_round_valid(ptr: *mut c_void) -> c_int {
    handle(ptr).map_or(0, |coord| coord.is_round_valid() as c_int)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_current_collection_id(ptr: *mut c_void) -> u64 {
    handle(ptr).map_or(0, |coord| coord.current_collection_id())
}

/// Rank gathering this round, or -1 for a null handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_designated_writer(ptr: *mut c_void) -> c_int {
    handle(ptr).map_or(-1, |coord| coord.designated_writer_slot() as c_int)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_must_write_now(ptr: *mut c_void) -> c_int {
    handle(ptr).map_or(0, |coord| coord.must_write_now() as c_int)
}

/// Id to write this round, or -1 when this rank does not write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_id_to_write(ptr: *mut c_void) -> i64 {
    handle(ptr)
        .and_then(|coord| coord.id_to_write())
        .map_or(-1i64, |id| id as i64)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_is_flush_point(ptr: *mut c_void) -> c_int {
    handle(ptr).map_or(0, |coord| coord.is_flush_point() as c_int)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_advance_round(ptr: *mut c_void) {
    if let Some(coord) = handle(ptr) {
        coord.advance_round();
    }
}

/// Record name and cnode count of a metric. Master rank only.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_define_metric(
    ptr: *mut c_void,
    metric: u32,
    name: *const c_char,
    cnodes: u64,
) -> c_int {
    let Some(coord) = handle(ptr) else {
        return -1;
    };
    if name.is_null() {
        eprintln!("cube_writer: null metric name");
        return -1;
    }
    let name = CStr::from_ptr(name).to_string_lossy();
    status("define_metric", coord.storage_mut().define_metric(metric, &name, cnodes as usize))
}

/// Mark the cnodes of a metric whose byte in `known` is non-zero. Master rank only.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_set_known_cnodes(ptr: *mut c_void, metric: u32, known: *const u8, n: usize) -> c_int {
    let (Some(coord), Some(known)) = (handle(ptr), slice_arg(known, n)) else {
        return -1;
    };
    let mask: Vec<bool> = known.iter().map(|byte| *byte != 0).collect();
    status("set_known_cnodes", coord.storage_mut().set_known_cnodes(metric, &mask))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_append_row(
    ptr: *mut c_void,
    metric: u32,
    cnode: u64,
    values: *const f64,
    nvalues: usize,
) -> c_int {
    let (Some(coord), Some(values)) = (handle(ptr), slice_arg(values, nvalues)) else {
        return -1;
    };
    status("append_row", coord.storage_mut().append_row(metric, cnode, values))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_flush(ptr: *mut c_void) -> c_int {
    handle(ptr).map_or(-1, |coord| status("flush", coord.storage_mut().flush()))
}

/// Print every counter and flag of the coordinator to stderr.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_dump(ptr: *mut c_void) {
    if let Some(coord) = handle(ptr) {
        eprintln!("{}", coord.dump());
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cubew_finalize(ptr: *mut c_void) -> c_int {
    if ptr.is_null() {
        return 0;
    }
    let coord = Box::from_raw(ptr as *mut Handle);
    status("finalize", coord.finalize())
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;
    use super::*;
    use crate::storage::file::read_report;

    #[test]
    fn test_single_rank_round_trip() {
        let dir = std::env::temp_dir().join(format!("cube-writer-capi-{}", std::process::id()));
        let c_dir = CString::new(dir.to_string_lossy().to_string()).unwrap();
        let c_name = CString::new("capi").unwrap();
        unsafe {
            let ptr = cubew_coordinator_create(0, 1, 1, c_dir.as_ptr(), c_name.as_ptr(), 0);
            assert!(!ptr.is_null());
            assert_eq!(cubew_is_round_valid(ptr), 0);
            let metric_name = CString::new("time").unwrap();
            assert_eq!(cubew_define_metric(ptr, 0, metric_name.as_ptr(), 3), 0);
            let known = [1u8, 0, 1];
            assert_eq!(cubew_set_known_cnodes(ptr, 0, known.as_ptr(), known.len()), 0);
            assert_eq!(cubew_set_known_cnodes(ptr, 0, std::ptr::null(), 3), -1);
            assert_eq!(cubew_append_row(ptr, 0, 0, std::ptr::null(), 2), -1);
            cubew_configure_metric(ptr, 3);
            let mut written = vec![];
            while cubew_is_round_valid(ptr) != 0 {
                assert_eq!(cubew_must_write_now(ptr), 1);
                assert_eq!(cubew_designated_writer(ptr), 0);
                let id = cubew_id_to_write(ptr);
                assert_eq!(id as u64, cubew_current_collection_id(ptr));
                let values = [id as f64; 2];
                assert_eq!(cubew_append_row(ptr, 0, id as u64, values.as_ptr(), values.len()), 0);
                if cubew_is_flush_point(ptr) != 0 {
                    assert_eq!(cubew_flush(ptr), 0);
                }
                written.push(id);
                cubew_advance_round(ptr);
            }
            assert_eq!(written, vec![0, 1, 2]);
            assert_eq!(cubew_finalize(ptr), 0);
        }
        let contents = read_report(&ReportIdentity::new(&dir, "capi")).unwrap();
        let metric = contents.index.metric(0).unwrap();
        assert_eq!(metric.name, "time");
        assert_eq!(metric.cnodes, 3);
        assert!(metric.is_known(0) && !metric.is_known(1) && metric.is_known(2));
        assert_eq!(contents.rows.len(), 3);
        assert_eq!(contents.metric_rows(0)[2].values, vec![2.0, 2.0]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_null_handle_is_rejected() {
        let ptr = std::ptr::null_mut();
        let name = CString::new("time").unwrap();
        let values = [1.0f64];
        unsafe {
            cubew_configure_metric(ptr, 4);
            cubew_advance_round(ptr);
            cubew_reset_round(ptr);
            cubew_dump(ptr);
            assert_eq!(cubew_is_round_valid(ptr), 0);
            assert_eq!(cubew_current_collection_id(ptr), 0);
            assert_eq!(cubew_designated_writer(ptr), -1);
            assert_eq!(cubew_must_write_now(ptr), 0);
            assert_eq!(cubew_id_to_write(ptr), -1);
            assert_eq!(cubew_is_flush_point(ptr), 0);
            assert_eq!(cubew_define_metric(ptr, 0, name.as_ptr(), 4), -1);
            assert_eq!(cubew_set_known_cnodes(ptr, 0, [1u8].as_ptr(), 1), -1);
            assert_eq!(cubew_append_row(ptr, 0, 0, values.as_ptr(), values.len()), -1);
            assert_eq!(cubew_flush(ptr), -1);
            assert_eq!(cubew_finalize(ptr), 0);
        }
    }

    #[test]
    fn test_create_rejects_bad_rank() {
        let c_dir = CString::new("/tmp").unwrap();
        let c_name = CString::new("bad").unwrap();
        unsafe {
            assert!(cubew_coordinator_create(2, 2, 1, c_dir.as_ptr(), c_name.as_ptr(), 0).is_null());
            assert!(cubew_coordinator_create(-1, 2, 1, c_dir.as_ptr(), c_name.as_ptr(), 0).is_null());
        }
    }
}
