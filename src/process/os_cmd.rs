//! Captured invocation of OS command-line tools.

use std::io::{ErrorKind, Read as _};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Why a single probe strategy produced no answer.
#[derive(Debug)]
pub(crate) enum ProbeError {
    /// The tool is not installed on this machine.
    ToolMissing(String),
    /// The API or tool exists but cannot answer here (permissions, platform).
    Unavailable(String),
    /// The tool ran and failed.
    Failed(String),
    TimedOut(String),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolMissing(tool) => write!(f, "{tool} not found"),
            Self::Unavailable(detail) => write!(f, "unavailable: {detail}"),
            Self::Failed(detail) => write!(f, "failed: {detail}"),
            Self::TimedOut(tool) => write!(f, "{tool} timed out"),
        }
    }
}

/// Suppress the console window a child would otherwise flash on Windows.
pub(crate) fn hide_console(cmd: &mut Command) -> &mut Command {
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt as _;
        use windows::Win32::System::Threading::CREATE_NO_WINDOW;
        cmd.creation_flags(CREATE_NO_WINDOW.0);
    }
    cmd
}

/// Decode tool output in the ANSI code page, dropping bytes that are not valid text.
#[cfg(target_os = "windows")]
pub(crate) fn decode_output(bytes: &[u8]) -> String {
    use windows::Win32::Globalization::GetACP;

    // SAFETY: GetACP takes no arguments and only reads process state.
    let code_page = unsafe { GetACP() };
    decode_code_page(bytes, code_page)
}

/// Decode tool output as UTF-8, dropping bytes that are not valid text.
#[cfg(not(target_os = "windows"))]
pub(crate) fn decode_output(bytes: &[u8]) -> String {
    strip_invalid(&String::from_utf8_lossy(bytes))
}

#[cfg(target_os = "windows")]
fn decode_code_page(bytes: &[u8], code_page: u32) -> String {
    use windows::Win32::Globalization::{MultiByteToWideChar, MULTI_BYTE_TO_WIDE_CHAR_FLAGS};

    if bytes.is_empty() {
        return String::new();
    }
    let flags = MULTI_BYTE_TO_WIDE_CHAR_FLAGS(0);
    // SAFETY: both calls only read `bytes` and write within `wide`.
    let needed = unsafe { MultiByteToWideChar(code_page, flags, bytes, None) };
    let len = usize::try_from(needed).unwrap_or(0);
    if len == 0 {
        return strip_invalid(&String::from_utf8_lossy(bytes));
    }
    let mut wide = vec![0u16; len];
    let written = unsafe { MultiByteToWideChar(code_page, flags, bytes, Some(&mut wide)) };
    wide.truncate(usize::try_from(written).unwrap_or(0));
    strip_invalid(&String::from_utf16_lossy(&wide))
}

fn strip_invalid(text: &str) -> String {
    text.chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .collect()
}

/// Run `program` with `args`, returning stdout if it exits successfully within `timeout`.
///
/// Output is drained on a helper thread so a chatty tool cannot stall on a full pipe.
pub(crate) fn run_captured(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, ProbeError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    hide_console(&mut cmd);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound => ProbeError::ToolMissing(program.to_string()),
        ErrorKind::PermissionDenied => ProbeError::Unavailable(format!("{program}: {e}")),
        _ => ProbeError::Failed(format!("{program}: {e}")),
    })?;

    let stdout = child.stdout.take();
    let reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout {
            let _ = out.read_to_end(&mut buf);
        }
        buf
    });
    let stderr = child.stderr.take();
    let err_reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr {
            let _ = err.read_to_end(&mut buf);
        }
        buf
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProbeError::TimedOut(program.to_string()));
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(25)),
            Err(e) => return Err(ProbeError::Failed(format!("{program}: {e}"))),
        }
    };

    let stdout = reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();

    if status.success() {
        Ok(decode_output(&stdout))
    } else {
        let detail = decode_output(&stderr);
        let detail = detail.trim();
        Err(ProbeError::Failed(format!(
            "{program} exited with {status}: {}",
            if detail.is_empty() { "(no output)" } else { detail }
        )))
    }
}
