//! Utility functions for working with files.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

//-----------------------------------------------------------------------------

static TEMP_FILE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Returns a name for a temporary file in the system temporary directory.
///
/// The name is based on the given prefix, the process id, and a counter,
/// so concurrent tests in the same process do not collide. The file itself
/// is not created.
pub fn temp_file_name(prefix: &str) -> PathBuf {
    let count = TEMP_FILE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let name = format!("{}_{}_{}", prefix, process::id(), count);
    std::env::temp_dir().join(name)
}

//-----------------------------------------------------------------------------


//-----------------------------------------------------------------------------
