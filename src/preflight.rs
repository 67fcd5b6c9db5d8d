//! Startup permission checks
//!
//! Run before the detection loop so a missing tool or missing rights
//! stop the program with a useful diagnostic instead of a dead stream.

use std::process::{Command, Stdio};
use thiserror::Error;

use crate::config::DetectionConfig;
use crate::models::Platform;

#[derive(Error, Debug)]
pub enum PreflightError {
    #[error("{0} is not installed")]
    ToolMissing(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

/// Verifies the process can read its log source
pub trait PermissionChecker {
    fn check(&self) -> Result<(), PreflightError>;
}

/// Whether journalctl's stderr reports missing read rights
pub fn journal_access_denied(stderr: &str) -> bool {
    stderr.contains("Permission denied") || stderr.contains("insufficient permissions")
}

/// Checks that journalctl exists and may read the sshd journal
pub struct JournalPermissionCheck {
    units: Vec<String>,
}

impl JournalPermissionCheck {
    pub fn new(units: Vec<String>) -> Self {
        JournalPermissionCheck { units }
    }
}

impl PermissionChecker for JournalPermissionCheck {
    fn check(&self) -> Result<(), PreflightError> {
        let installed = Command::new("journalctl")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if !installed {
            return Err(PreflightError::ToolMissing("journalctl".to_string()));
        }

        let mut query = Command::new("journalctl");
        for unit in &self.units {
            query.arg("-u").arg(unit);
        }
        let output = query
            .args(["-n", "1", "--no-pager"])
            .stdin(Stdio::null())
            .output()
            .map_err(|_| PreflightError::ToolMissing("journalctl".to_string()))?;

        if journal_access_denied(&String::from_utf8_lossy(&output.stderr)) {
            return Err(PreflightError::PermissionDenied(
                "cannot read the sshd journal; add your user to the 'adm' group \
                 (sudo usermod -aG adm $USER)"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Checks the process token is elevated, which the Security log requires
pub struct AdminCheck;

impl PermissionChecker for AdminCheck {
    fn check(&self) -> Result<(), PreflightError> {
        if is_elevated() {
            Ok(())
        } else {
            Err(PreflightError::PermissionDenied(
                "run from an elevated (administrator) prompt".to_string(),
            ))
        }
    }
}

#[cfg(windows)]
fn is_elevated() -> bool {
    use std::mem::MaybeUninit;
    use std::ptr;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::Security::{
        GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token: HANDLE = ptr::null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            log::warn!("Could not open the process token");
            return false;
        }

        let mut elevation = MaybeUninit::<TOKEN_ELEVATION>::uninit();
        let mut returned: u32 = 0;
        let result = GetTokenInformation(
            token,
            TokenElevation,
            elevation.as_mut_ptr() as *mut _,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        );
        CloseHandle(token);

        if result == 0 {
            return false;
        }
        elevation.assume_init().TokenIsElevated != 0
    }
}

#[cfg(not(windows))]
fn is_elevated() -> bool {
    false
}

/// Checker matching the platform's log source
pub fn checker_for(platform: Platform, config: &DetectionConfig) -> Box<dyn PermissionChecker> {
    match platform {
        Platform::Linux => Box::new(JournalPermissionCheck::new(config.journal_units.clone())),
        Platform::Windows => Box::new(AdminCheck),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_messages() {
        assert!(journal_access_denied(
            "Hint: You are currently not seeing messages from other users and the system.\n\
             Failed to open journal: Permission denied"
        ));
        assert!(journal_access_denied(
            "No journal files were opened due to insufficient permissions."
        ));
        assert!(!journal_access_denied(""));
        assert!(!journal_access_denied("-- No entries --"));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_admin_check_denied_off_windows() {
        assert!(matches!(
            AdminCheck.check(),
            Err(PreflightError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            PreflightError::ToolMissing("journalctl".to_string()).to_string(),
            "journalctl is not installed"
        );
    }
}
