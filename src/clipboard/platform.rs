//! Platform-specific clipboard backends, shelled out the same way the
//! multiplexer wrapper and the Tailscale client do.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

/// Set the OS clipboard to `text`.
pub fn set_text(text: &str) -> Result<()> {
    if cfg!(target_os = "macos") {
        run_with_stdin("pbcopy", &[], text.as_bytes())
    } else if cfg!(target_os = "linux") {
        run_with_stdin("wl-copy", &[], text.as_bytes())
            .or_else(|_| run_with_stdin("xclip", &["-selection", "clipboard"], text.as_bytes()))
    } else if cfg!(target_os = "windows") {
        run_with_stdin("clip", &[], text.as_bytes())
    } else {
        bail!("no clipboard backend for this platform")
    }
}

/// Set the OS clipboard to the raw bytes of an image file at `path`, when a
/// backend supports it directly; otherwise callers fall back to sending the
/// file path to the terminal instead.
pub fn set_image(path: &std::path::Path) -> Result<()> {
    if cfg!(target_os = "macos") {
        let script = format!("set the clipboard to (read (POSIX file \"{}\") as «class PNGf»)", path.display());
        run("osascript", &["-e", &script])
    } else if cfg!(target_os = "linux") {
        let mime = mime_for(path);
        let file = std::fs::File::open(path).context("opening image file for clipboard copy")?;
        run_with_stdin_from_file("wl-copy", &["--type", mime], file)
    } else {
        bail!("no image clipboard backend for this platform")
    }
}

/// The multiplexer key name for the platform paste shortcut. Sent straight
/// through `Tmux::send_named_key`, bypassing normal key encoding — this is a
/// synthetic keystroke the clipboard manager injects, not user input.
pub fn paste_key_name() -> &'static str {
    if cfg!(target_os = "macos") {
        "M-v"
    } else {
        "C-v"
    }
}

fn mime_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

fn run(binary: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(binary).args(args).output().with_context(|| format!("failed to execute {binary}"))?;
    if !output.status.success() {
        bail!("{binary} exited with {}: {}", output.status, String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

fn run_with_stdin(binary: &str, args: &[&str], input: &[u8]) -> Result<()> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {binary}"))?;
    child.stdin.take().expect("piped stdin").write_all(input).context("writing to clipboard backend stdin")?;
    let output = child.wait_with_output().with_context(|| format!("failed to wait on {binary}"))?;
    if !output.status.success() {
        bail!("{binary} exited with {}: {}", output.status, String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

fn run_with_stdin_from_file(binary: &str, args: &[&str], mut file: std::fs::File) -> Result<()> {
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut file, &mut buf).context("reading image file for clipboard copy")?;
    run_with_stdin(binary, args, &buf)
}
