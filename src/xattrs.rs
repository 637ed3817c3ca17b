//! Extended attribute copying.
//!
//! POSIX ACLs are stored in the `system.posix_acl_access` and
//! `system.posix_acl_default` attributes, so copying attributes copies ACLs.
//! Symlinks are never followed.

use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{BuildError, Result};

/// Namespaces a process without root may write.
const UNPRIVILEGED_NAMESPACES: &[&[u8]] = &[b"user.", b"system.posix_acl_"];

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))
}

fn is_errno(err: &io::Error, errno: i32) -> bool {
    err.raw_os_error() == Some(errno)
}

/// Attribute names on `path`. A filesystem without xattr support has none.
pub fn list(path: &Path) -> io::Result<Vec<CString>> {
    let c = c_path(path)?;
    loop {
        let size = unsafe { libc::llistxattr(c.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            let err = io::Error::last_os_error();
            if is_errno(&err, libc::ENOTSUP) {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        if size == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; size as usize];
        let got = unsafe { libc::llistxattr(c.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        if got < 0 {
            let err = io::Error::last_os_error();
            // The list grew between the two calls.
            if is_errno(&err, libc::ERANGE) {
                continue;
            }
            return Err(err);
        }
        buf.truncate(got as usize);
        return Ok(buf
            .split(|&b| b == 0)
            .filter(|name| !name.is_empty())
            .filter_map(|name| CString::new(name).ok())
            .collect());
    }
}

/// Value of `name` on `path`, or `None` if it is gone or unsupported.
pub fn get(path: &Path, name: &CStr) -> io::Result<Option<Vec<u8>>> {
    let c = c_path(path)?;
    loop {
        let size = unsafe { libc::lgetxattr(c.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            let err = io::Error::last_os_error();
            if is_errno(&err, libc::ENODATA) || is_errno(&err, libc::ENOTSUP) {
                return Ok(None);
            }
            return Err(err);
        }

        let mut buf = vec![0u8; size as usize];
        let got = unsafe {
            libc::lgetxattr(c.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        };
        if got < 0 {
            let err = io::Error::last_os_error();
            if is_errno(&err, libc::ERANGE) {
                continue;
            }
            return Err(err);
        }
        buf.truncate(got as usize);
        return Ok(Some(buf));
    }
}

/// Set `name` on `path`, creating or replacing it.
pub fn set(path: &Path, name: &CStr, value: &[u8]) -> io::Result<()> {
    let c = c_path(path)?;
    let rc = unsafe {
        libc::lsetxattr(c.as_ptr(), name.as_ptr(), value.as_ptr().cast(), value.len(), 0)
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Whether an attribute may be copied by a process with this privilege.
///
/// Matches rsync `-X`: root copies every namespace, other users only
/// `user.*` (plus ACLs, which the file owner may always set).
pub fn copyable(name: &CStr, privileged: bool) -> bool {
    privileged
        || UNPRIVILEGED_NAMESPACES
            .iter()
            .any(|ns| name.to_bytes().starts_with(ns))
}

/// Copy every copyable attribute from `src` to `dest`.
///
/// A source that vanished contributes nothing. Failing to write an
/// attribute to `dest` is an error: the copy would silently lose
/// capabilities or ACLs otherwise.
pub fn copy_all(src: &Path, dest: &Path, privileged: bool) -> Result<usize> {
    let names = match list(src) {
        Ok(names) => names,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(BuildError::Io {
                context: format!("listing extended attributes of {}", src.display()),
                source: e,
            })
        }
    };

    let mut copied = 0;
    for name in names.iter().filter(|n| copyable(n, privileged)) {
        let value = get(src, name).map_err(BuildError::io(format!(
            "reading {} of {}",
            name.to_string_lossy(),
            src.display()
        )))?;
        let Some(value) = value else {
            continue;
        };
        set(dest, name, &value).map_err(BuildError::io(format!(
            "copying extended attribute {} to {}",
            name.to_string_lossy(),
            dest.display()
        )))?;
        copied += 1;
    }
    Ok(copied)
}
