//! Creation of the per-room FIFO.

use std::{
    ffi::CString,
    fs::{OpenOptions, Permissions},
    io,
    os::unix::{
        ffi::OsStrExt,
        fs::{OpenOptionsExt, PermissionsExt},
    },
    path::Path,
};

use log::{debug, trace};
use tokio::fs;

use crate::mirror::create_private_dir;

/// Permissions of the FIFO: owner read/write only.
pub const CONDUIT_MODE: u32 = 0o600;

/// Creates the FIFO at `path`, replacing whatever a previous run left there.
///
/// The parent directory is created owner-only if missing.
///
/// # Errors
///
/// Returns an error if the directory, the removal of the stale entry or the
/// FIFO creation fails.
pub async fn create_conduit(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        create_private_dir(parent).await?;
    }

    match fs::remove_file(path).await {
        Ok(()) => debug!("removed stale conduit {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    mkfifo(path)?;
    // mkfifo applies the umask, set the exact mode afterwards
    fs::set_permissions(path, Permissions::from_mode(CONDUIT_MODE)).await?;

    debug!("created conduit {}", path.display());
    Ok(())
}

fn mkfifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;

    // SAFETY: `c_path` is a valid NUL-terminated string living across the call
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), CONDUIT_MODE as libc::mode_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Unblocks a reader waiting in `open` on the FIFO at `path`.
///
/// Opening the write end without blocking succeeds only if a reader is
/// waiting, closing it right away makes that reader see end of input.
pub(crate) fn wake_reader(path: &Path) {
    match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
    {
        Ok(_) => trace!("woke reader of {}", path.display()),
        Err(e) => trace!("no reader to wake on {}: {}", path.display(), e),
    }
}
