use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, error};

use crate::config::ContextFallback;
use crate::model::StepOutput;

/// Ownership and security-label facade. `chown` and `chcon` apply to the whole
/// tree under `path` and never follow symlinks.
pub trait SecurityContext: Send + Sync {
    /// Current label of `path`; empty when the path carries none.
    fn get_context(&self, path: &Path) -> io::Result<String>;

    fn owner(&self, path: &Path) -> io::Result<(u32, u32)>;

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    fn chcon(&self, path: &Path, context: &str) -> io::Result<()>;
}

/// Captures a destination's label before extraction and re-applies owner and
/// label afterwards.
pub struct ContextRestorer<'a> {
    security: &'a dyn SecurityContext,
    fallback: &'a ContextFallback,
}

impl<'a> ContextRestorer<'a> {
    pub fn new(security: &'a dyn SecurityContext, fallback: &'a ContextFallback) -> Self {
        Self { security, fallback }
    }

    pub fn capture(&self, path: &Path) -> Option<String> {
        match self.security.get_context(path) {
            Ok(context) => {
                let context = context.trim();
                (!context.is_empty()).then(|| context.to_string())
            }
            Err(e) => {
                debug!(
                    event = "context.read_failed",
                    path = %path.display(),
                    error = %e,
                    "context.read_failed"
                );
                None
            }
        }
    }

    /// Label to apply when nothing was captured: the parent's, with the
    /// configured token swapped.
    pub fn derive_fallback(&self, parent: &Path) -> Option<String> {
        self.capture(parent)
            .map(|context| context.replace(&self.fallback.from, &self.fallback.to))
    }

    pub fn restore(
        &self,
        dst: &Path,
        parent: &Path,
        uid: u32,
        gid: u32,
        captured: Option<&str>,
    ) -> StepOutput {
        if let Err(e) = self.security.chown(dst, uid, gid) {
            error!(
                event = "context.chown_failed",
                path = %dst.display(),
                uid,
                gid,
                error = %e,
                "context.chown_failed"
            );
            return StepOutput::line(
                false,
                format!("Failed to set ownership {uid}:{gid} on {}: {e}", dst.display()),
            );
        }

        let context = match captured {
            Some(context) => context.to_string(),
            None => match self.derive_fallback(parent) {
                Some(context) => context,
                None => {
                    error!(
                        event = "context.restore_failed",
                        path = %dst.display(),
                        reason = "no label captured or derivable",
                        "context.restore_failed"
                    );
                    return StepOutput::line(
                        false,
                        format!("Failed to restore context: {}", dst.display()),
                    );
                }
            },
        };

        if let Err(e) = self.security.chcon(dst, &context) {
            error!(
                event = "context.restore_failed",
                path = %dst.display(),
                error = %e,
                "context.restore_failed"
            );
            return StepOutput::line(
                false,
                format!("Failed to restore context: {}: {e}", dst.display()),
            );
        }

        StepOutput::line(
            true,
            format!("Restored {uid}:{gid} {context} on {}.", dst.display()),
        )
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux {
    use std::ffi::{CStr, CString};
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;

    use walkdir::WalkDir;

    use super::SecurityContext;

    const SELINUX_XATTR: &CStr = c"security.selinux";
    const MAX_CONTEXT_LEN: usize = 64 * 1024;

    /// SELinux labels through the `security.selinux` xattr; ownership through `lchown`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LinuxSecurityContext;

    impl LinuxSecurityContext {
        pub fn new() -> Self {
            Self
        }
    }

    fn c_path(path: &Path) -> io::Result<CString> {
        CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "path contains an interior NUL")
        })
    }

    fn set_label(path: &Path, value: &CStr) -> io::Result<()> {
        let c = c_path(path)?;
        let bytes = value.to_bytes_with_nul();
        // SAFETY: both strings are NUL-terminated and `bytes` outlives the call.
        let rc = unsafe {
            libc::lsetxattr(
                c.as_ptr(),
                SELINUX_XATTR.as_ptr(),
                bytes.as_ptr().cast(),
                bytes.len(),
                0,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    impl SecurityContext for LinuxSecurityContext {
        fn get_context(&self, path: &Path) -> io::Result<String> {
            let c = c_path(path)?;
            let mut buf = vec![0u8; 256];
            loop {
                // SAFETY: `buf` is a live allocation of `buf.len()` bytes.
                let n = unsafe {
                    libc::lgetxattr(
                        c.as_ptr(),
                        SELINUX_XATTR.as_ptr(),
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                    )
                };
                if n >= 0 {
                    buf.truncate(n as usize);
                    break;
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::ERANGE) if buf.len() < MAX_CONTEXT_LEN => {
                        let len = buf.len() * 4;
                        buf.resize(len, 0);
                    }
                    Some(libc::ENODATA) | Some(libc::ENOTSUP) => return Ok(String::new()),
                    _ => return Err(err),
                }
            }
            while buf.last() == Some(&0) {
                buf.pop();
            }
            Ok(String::from_utf8_lossy(&buf).into_owned())
        }

        fn owner(&self, path: &Path) -> io::Result<(u32, u32)> {
            let meta = std::fs::symlink_metadata(path)?;
            Ok((meta.uid(), meta.gid()))
        }

        fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
            for entry in WalkDir::new(path).follow_links(false) {
                let entry = entry.map_err(io::Error::from)?;
                std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid))?;
            }
            Ok(())
        }

        fn chcon(&self, path: &Path, context: &str) -> io::Result<()> {
            let value = CString::new(context).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "context contains an interior NUL")
            })?;
            for entry in WalkDir::new(path).follow_links(false) {
                let entry = entry.map_err(io::Error::from)?;
                set_label(entry.path(), &value)?;
            }
            Ok(())
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::LinuxSecurityContext;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PathAttrs {
    context: Option<String>,
    owner: Option<(u32, u32)>,
}

/// Label and owner bookkeeping without touching the filesystem. Owners of
/// unregistered paths are read from disk.
#[derive(Debug, Default)]
pub struct InMemorySecurityContext {
    attrs: Mutex<HashMap<PathBuf, PathAttrs>>,
}

impl InMemorySecurityContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_attrs<T>(&self, f: impl FnOnce(&mut HashMap<PathBuf, PathAttrs>) -> T) -> T {
        let mut guard = self.attrs.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn set_context(&self, path: impl Into<PathBuf>, context: impl Into<String>) {
        let context = context.into();
        self.with_attrs(|attrs| attrs.entry(path.into()).or_default().context = Some(context));
    }

    pub fn set_owner(&self, path: impl Into<PathBuf>, uid: u32, gid: u32) {
        self.with_attrs(|attrs| attrs.entry(path.into()).or_default().owner = Some((uid, gid)));
    }

    pub fn context_of(&self, path: &Path) -> Option<String> {
        self.with_attrs(|attrs| attrs.get(path).and_then(|a| a.context.clone()))
    }

    pub fn owner_of(&self, path: &Path) -> Option<(u32, u32)> {
        self.with_attrs(|attrs| attrs.get(path).and_then(|a| a.owner))
    }
}

impl SecurityContext for InMemorySecurityContext {
    fn get_context(&self, path: &Path) -> io::Result<String> {
        Ok(self.context_of(path).unwrap_or_default())
    }

    fn owner(&self, path: &Path) -> io::Result<(u32, u32)> {
        if let Some(owner) = self.owner_of(path) {
            return Ok(owner);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let meta = std::fs::symlink_metadata(path)?;
            Ok((meta.uid(), meta.gid()))
        }
        #[cfg(not(unix))]
        {
            std::fs::symlink_metadata(path).map(|_| (0, 0))
        }
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        std::fs::symlink_metadata(path)?;
        self.set_owner(path, uid, gid);
        Ok(())
    }

    fn chcon(&self, path: &Path, context: &str) -> io::Result<()> {
        std::fs::symlink_metadata(path)?;
        self.set_context(path, context);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback() -> ContextFallback {
        ContextFallback::default()
    }

    #[test]
    fn captured_label_wins_over_parent() {
        let temp = tempfile::tempdir().unwrap();
        let dst = temp.path().join("com.app");
        std::fs::create_dir_all(&dst).unwrap();

        let sec = InMemorySecurityContext::new();
        sec.set_context(temp.path(), "u:object_r:system_data_file:s0");
        let fb = fallback();
        let restorer = ContextRestorer::new(&sec, &fb);

        let out = restorer.restore(
            &dst,
            temp.path(),
            10123,
            10123,
            Some("u:object_r:app_data_file:s0:c123,c256"),
        );
        assert!(out.success, "{:?}", out.lines);
        assert_eq!(sec.owner_of(&dst), Some((10123, 10123)));
        assert_eq!(
            sec.context_of(&dst).as_deref(),
            Some("u:object_r:app_data_file:s0:c123,c256")
        );
    }

    #[test]
    fn parent_label_is_derived_when_nothing_was_captured() {
        let temp = tempfile::tempdir().unwrap();
        let dst = temp.path().join("com.app");
        std::fs::create_dir_all(&dst).unwrap();

        let sec = InMemorySecurityContext::new();
        sec.set_context(temp.path(), "u:object_r:system_data_file:s0");
        let fb = fallback();
        let restorer = ContextRestorer::new(&sec, &fb);

        assert_eq!(restorer.capture(&dst), None);
        let out = restorer.restore(&dst, temp.path(), 10001, 1078, None);
        assert!(out.success, "{:?}", out.lines);
        assert_eq!(
            sec.context_of(&dst).as_deref(),
            Some("u:object_r:app_data_file:s0")
        );
        assert_eq!(sec.owner_of(&dst), Some((10001, 1078)));
    }

    #[test]
    fn missing_labels_everywhere_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let dst = temp.path().join("com.app");
        std::fs::create_dir_all(&dst).unwrap();

        let sec = InMemorySecurityContext::new();
        let fb = fallback();
        let restorer = ContextRestorer::new(&sec, &fb);

        let out = restorer.restore(&dst, temp.path(), 10001, 10001, None);
        assert!(!out.success);
        assert_eq!(
            out.lines,
            vec![format!("Failed to restore context: {}", dst.display())]
        );
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn linux_owner_reads_metadata() {
        use std::os::unix::fs::MetadataExt;

        let temp = tempfile::tempdir().unwrap();
        let meta = std::fs::metadata(temp.path()).unwrap();
        let owner = LinuxSecurityContext::new().owner(temp.path()).unwrap();
        assert_eq!(owner, (meta.uid(), meta.gid()));
    }
}
