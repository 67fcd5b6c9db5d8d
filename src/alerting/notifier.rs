//! Notification backends
//!
//! Messages are passed to helper programs as separate arguments or
//! environment variables, never through a shell. Helpers run in the
//! background: `notify` returns once the program has started, and a helper
//! still running after [`NOTIFY_TIMEOUT`] is killed.

use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

use super::SinkError;
use crate::config::NotificationConfig;
use crate::models::Platform;

/// Longest a notification helper may run
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Shows an alert to the user
pub trait Notifier: Send {
    fn notify(&self, title: &str, message: &str) -> Result<(), SinkError>;
}

fn check_output(program: &str, output: Output) -> Result<(), SinkError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(SinkError::Command {
            program: program.to_string(),
            detail: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

/// Start `command` and watch it from a background task
///
/// Must be called from within a Tokio runtime.
fn launch(program: &str, mut command: Command, timeout: Duration) -> Result<(), SinkError> {
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SinkError::Command {
            program: program.to_string(),
            detail: e.to_string(),
        })?;

    let program = program.to_string();
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if let Err(e) = check_output(&program, output) {
                    log::warn!("Notification failed: {}", e);
                }
            }
            Ok(Err(e)) => log::warn!("Notification failed: {}: {}", program, e),
            Err(_) => log::warn!("{} still running after {:?}, killed", program, timeout),
        }
    });
    Ok(())
}

/// freedesktop notification through `notify-send`
pub struct DesktopNotifier;

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<(), SinkError> {
        let mut command = Command::new("notify-send");
        command.arg("--").arg(title).arg(message);
        launch("notify-send", command, NOTIFY_TIMEOUT)
    }
}

const TOAST_SCRIPT: &str = "$ErrorActionPreference = 'Stop'; \
    [Windows.UI.Notifications.ToastNotificationManager, Windows.UI.Notifications, ContentType = WindowsRuntime] | Out-Null; \
    $xml = [Windows.UI.Notifications.ToastNotificationManager]::GetTemplateContent([Windows.UI.Notifications.ToastTemplateType]::ToastText02); \
    $text = $xml.GetElementsByTagName('text'); \
    $text.Item(0).AppendChild($xml.CreateTextNode($env:AUTHWATCH_TITLE)) | Out-Null; \
    $text.Item(1).AppendChild($xml.CreateTextNode($env:AUTHWATCH_MESSAGE)) | Out-Null; \
    $toast = [Windows.UI.Notifications.ToastNotification]::new($xml); \
    [Windows.UI.Notifications.ToastNotificationManager]::CreateToastNotifier('authwatch').Show($toast)";

/// Windows toast raised from PowerShell
pub struct ToastNotifier;

impl Notifier for ToastNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<(), SinkError> {
        let mut command = Command::new("powershell");
        command
            .args(["-NoProfile", "-NonInteractive", "-Command", TOAST_SCRIPT])
            .env("AUTHWATCH_TITLE", title)
            .env("AUTHWATCH_MESSAGE", message);
        launch("powershell", command, NOTIFY_TIMEOUT)
    }
}

/// Prints alerts on stdout, for platforms without a desktop backend
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<(), SinkError> {
        println!("[NOTIFICATION] {}: {}", title, message);
        Ok(())
    }
}

/// Used when notifications are disabled
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _title: &str, _message: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Notifier paired with the platform's log source
pub fn notifier_for(platform: Option<Platform>, config: &NotificationConfig) -> Box<dyn Notifier> {
    if !config.enabled {
        return Box::new(NullNotifier);
    }
    match platform {
        Some(Platform::Linux) => Box::new(DesktopNotifier),
        Some(Platform::Windows) => Box::new(ToastNotifier),
        None => Box::new(ConsoleNotifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_missing_program_is_sink_error() {
        let command = Command::new("authwatch-no-such-program");
        let err = launch("authwatch-no-such-program", command, NOTIFY_TIMEOUT).unwrap_err();
        assert!(matches!(err, SinkError::Command { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_helper_does_not_block() {
        let mut command = Command::new("sleep");
        command.arg("30");

        let started = Instant::now();
        launch("sleep", command, Duration::from_millis(50)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        // let the watcher hit its timeout and kill the helper
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_exit_is_sink_error() {
        use std::os::unix::process::ExitStatusExt;

        let output = Output {
            status: std::process::ExitStatus::from_raw(1 << 8),
            stdout: Vec::new(),
            stderr: b"Cannot autolaunch D-Bus without X11 $DISPLAY".to_vec(),
        };
        match check_output("notify-send", output).unwrap_err() {
            SinkError::Command { program, detail } => {
                assert_eq!(program, "notify-send");
                assert!(detail.contains("D-Bus"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_disabled_notifications() {
        let config = NotificationConfig {
            enabled: false,
            ..NotificationConfig::default()
        };
        assert!(notifier_for(Some(Platform::Linux), &config)
            .notify("t", "m")
            .is_ok());
    }

    #[test]
    fn test_console_fallback() {
        let notifier = notifier_for(None, &NotificationConfig::default());
        assert!(notifier.notify("Intrusion Alert", "hello").is_ok());
    }
}
