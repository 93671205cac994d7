// Thin host bridge. Only the launcher-level verbs have a portable primitive;
// everything else reports "not supported" so a real bridge can be swapped in.

use super::{unsupported, ActionOutcome, OsAutomation, WindowOp};
use crate::plan::MouseButton;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

pub struct SystemOsBridge;

fn launch_command(name: &str, args: &[String]) -> Command {
    #[cfg(target_os = "macos")]
    {
        let mut cmd = Command::new("open");
        cmd.arg("-a").arg(name);
        if !args.is_empty() {
            cmd.arg("--args").args(args);
        }
        cmd
    }

    #[cfg(target_os = "windows")]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", "start", "", name]).args(args);
        cmd
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let mut cmd = Command::new(name);
        cmd.args(args);
        cmd
    }
}

fn quit_command(name: &str) -> Command {
    #[cfg(target_os = "macos")]
    {
        let mut cmd = Command::new("osascript");
        cmd.arg("-e").arg(format!("quit app \"{}\"", name.replace('"', "")));
        cmd
    }

    #[cfg(target_os = "windows")]
    {
        let mut cmd = Command::new("taskkill");
        cmd.args(["/IM", name, "/F"]);
        cmd
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let mut cmd = Command::new("pkill");
        cmd.arg("-x").arg(name);
        cmd
    }
}

async fn run_to_completion(mut cmd: Command, label: &str) -> ActionOutcome {
    let started = Instant::now();
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped());
    match cmd.output().await {
        Ok(output) if output.status.success() => ActionOutcome::ok(label).timed_from(started),
        Ok(output) => ActionOutcome::failed(format!(
            "{} failed: {}",
            label,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
        .timed_from(started),
        Err(err) => ActionOutcome::failed(format!("{} failed: {}", label, err)).timed_from(started),
    }
}

#[async_trait]
impl OsAutomation for SystemOsBridge {
    async fn open_url(&self, url: &str) -> ActionOutcome {
        let started = Instant::now();
        match open::that_detached(url) {
            Ok(()) => ActionOutcome::ok(format!("opened {}", url)).timed_from(started),
            Err(err) => {
                ActionOutcome::failed(format!("open {} failed: {}", url, err)).timed_from(started)
            }
        }
    }

    async fn open_app(&self, name: &str, args: &[String]) -> ActionOutcome {
        let started = Instant::now();
        let mut cmd = launch_command(name, args);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        // The launched app outlives this call; only the spawn is awaited.
        match cmd.spawn() {
            Ok(_child) => ActionOutcome::ok(format!("launched {}", name)).timed_from(started),
            Err(err) => {
                ActionOutcome::failed(format!("launch {} failed: {}", name, err)).timed_from(started)
            }
        }
    }

    async fn close_app(&self, name: &str) -> ActionOutcome {
        run_to_completion(quit_command(name), &format!("close {}", name)).await
    }

    async fn focus_app(&self, _name: &str) -> ActionOutcome {
        unsupported("app_focus")
    }

    async fn clipboard_read(&self) -> ActionOutcome {
        unsupported("clipboard_read")
    }

    async fn clipboard_write(&self, _text: &str) -> ActionOutcome {
        unsupported("clipboard_write")
    }

    async fn notify(&self, _title: &str, _body: &str) -> ActionOutcome {
        unsupported("notification")
    }

    async fn click(&self, _x: i32, _y: i32, _button: MouseButton, _double: bool) -> ActionOutcome {
        unsupported("gui_click")
    }

    async fn type_text(&self, _text: &str) -> ActionOutcome {
        unsupported("gui_type")
    }

    async fn hotkey(&self, _keys: &[String]) -> ActionOutcome {
        unsupported("gui_hotkey")
    }

    async fn scroll(&self, _dx: i32, _dy: i32) -> ActionOutcome {
        unsupported("gui_scroll")
    }

    async fn window(&self, op: WindowOp, _title: &str) -> ActionOutcome {
        let verb = match op {
            WindowOp::Focus => "window_focus",
            WindowOp::Minimize => "window_minimize",
            WindowOp::Maximize => "window_maximize",
            WindowOp::Close => "window_close",
        };
        unsupported(verb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn verbs_without_primitive_fail_cleanly() {
        let bridge = SystemOsBridge;
        let outcome = bridge.clipboard_write("x").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("clipboard_write"));

        let outcome = bridge.window(WindowOp::Minimize, "Editor").await;
        assert!(outcome.error.unwrap().contains("window_minimize"));
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    #[tokio::test]
    async fn missing_app_launch_is_failure() {
        let outcome = SystemOsBridge
            .open_app("definitely-not-an-installed-app-xyz", &[])
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("launch"));
    }
}
