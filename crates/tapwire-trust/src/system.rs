//! Operating system trust stores.
//!
//! Handles:
//! - Linux anchor directories (Debian/Ubuntu, Fedora/RHEL, Arch)
//! - macOS login keychain
//! - Windows current-user Root store

use std::io::Write;
use std::path::Path;
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
use std::process::{Command, Output};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{InstallError, TrustStoreError};
use crate::state::TrustAnchor;
use crate::store::TrustStore;

/// Linux anchor directory, update command and arguments.
#[cfg(target_os = "linux")]
const LINUX_ANCHORS: [(&str, &str, &[&str]); 3] = [
    (
        "/usr/local/share/ca-certificates",
        "update-ca-certificates",
        &[],
    ),
    (
        "/etc/pki/ca-trust/source/anchors",
        "update-ca-trust",
        &["extract"],
    ),
    (
        "/etc/ca-certificates/trust-source/anchors",
        "trust",
        &["extract-compat"],
    ),
];

/// Trust store backed by the host operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTrustStore;

impl SystemTrustStore {
    /// Creates the system trust store.
    pub fn new() -> Self {
        Self
    }
}

impl TrustStore for SystemTrustStore {
    fn is_ca_trusted(&self, anchor: &TrustAnchor) -> Result<bool, TrustStoreError> {
        #[cfg(target_os = "linux")]
        {
            is_trusted_linux(anchor)
        }

        #[cfg(target_os = "macos")]
        {
            is_trusted_macos(anchor)
        }

        #[cfg(target_os = "windows")]
        {
            is_trusted_windows(anchor)
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            let _ = anchor;
            Err(TrustStoreError::Unsupported)
        }
    }

    fn install_ca(&self, anchor: &TrustAnchor) -> Result<(), InstallError> {
        let pem_file = write_pem(anchor)?;
        tracing::info!(
            "Installing root CA {:?} into the system trust store",
            anchor.display_name()
        );

        #[cfg(target_os = "linux")]
        {
            install_linux(anchor, pem_file.path())
        }

        #[cfg(target_os = "macos")]
        {
            install_macos(pem_file.path())
        }

        #[cfg(target_os = "windows")]
        {
            install_windows(pem_file.path())
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            let _ = pem_file;
            Err(InstallError::PlatformRejected(
                "unsupported operating system".into(),
            ))
        }
    }

    fn uninstall_ca(&self, anchor: &TrustAnchor) -> Result<(), InstallError> {
        #[cfg(target_os = "linux")]
        {
            uninstall_linux(anchor)
        }

        #[cfg(target_os = "macos")]
        {
            uninstall_macos(anchor)
        }

        #[cfg(target_os = "windows")]
        {
            uninstall_windows(anchor)
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            let _ = anchor;
            Err(InstallError::PlatformRejected(
                "unsupported operating system".into(),
            ))
        }
    }
}

fn write_pem(anchor: &TrustAnchor) -> Result<tempfile::NamedTempFile, InstallError> {
    let mut file = tempfile::Builder::new()
        .prefix(anchor.alias())
        .suffix(".crt")
        .tempfile()
        .map_err(|e| InstallError::PlatformRejected(format!("temp file: {}", e)))?;
    file.write_all(anchor.pem().as_bytes())
        .map_err(|e| InstallError::PlatformRejected(format!("temp file: {}", e)))?;
    Ok(file)
}

/// Maps a finished install command to an install result.
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn classify(output: std::io::Result<Output>, tool: &str) -> Result<(), InstallError> {
    let output =
        output.map_err(|e| InstallError::PlatformRejected(format!("failed to run {}: {}", tool, e)))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
    // pkexec exits 126 when its dialog is dismissed
    let dismissed = output.status.code() == Some(126)
        || ["dismissed", "cancel", "not authorized", "user interaction"]
            .iter()
            .any(|needle| stderr.contains(needle));
    if dismissed {
        Err(InstallError::UserDeclined)
    } else {
        Err(InstallError::PlatformRejected(format!(
            "{} failed: {}",
            tool,
            stderr.trim()
        )))
    }
}

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
fn elevation_cmd() -> &'static str {
    if std::env::var("DISPLAY").is_ok() || std::env::var("WAYLAND_DISPLAY").is_ok() {
        "pkexec"
    } else {
        "sudo"
    }
}

#[cfg(target_os = "linux")]
fn is_trusted_linux(anchor: &TrustAnchor) -> Result<bool, TrustStoreError> {
    for (dir, _, _) in LINUX_ANCHORS {
        let path = Path::new(dir).join(format!("{}.crt", anchor.alias()));
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let installed = pem::parse(&contents)
            .map_err(|e| TrustStoreError::Unavailable(format!("{:?}: {}", path, e)))?;
        if installed.contents() == anchor.der() {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(target_os = "linux")]
fn install_linux(anchor: &TrustAnchor, pem_path: &Path) -> Result<(), InstallError> {
    let Some((dir, update, update_args)) = LINUX_ANCHORS
        .iter()
        .find(|(dir, _, _)| Path::new(dir).exists())
    else {
        return Err(InstallError::PlatformRejected(
            "unknown Linux distribution, install the CA certificate manually".into(),
        ));
    };

    let elevation = elevation_cmd();
    let dest = Path::new(dir).join(format!("{}.crt", anchor.alias()));
    let copy = Command::new(elevation)
        .arg("cp")
        .arg(pem_path)
        .arg(&dest)
        .output();
    classify(copy, elevation)?;

    let refresh = Command::new(elevation)
        .arg(update)
        .args(update_args.iter())
        .output();
    classify(refresh, update)
}

#[cfg(target_os = "linux")]
fn uninstall_linux(anchor: &TrustAnchor) -> Result<(), InstallError> {
    let elevation = elevation_cmd();
    for (dir, update, update_args) in LINUX_ANCHORS {
        let path = Path::new(dir).join(format!("{}.crt", anchor.alias()));
        if !path.exists() {
            continue;
        }
        classify(Command::new(elevation).arg("rm").arg(&path).output(), elevation)?;
        classify(
            Command::new(elevation)
                .arg(update)
                .args(update_args.iter())
                .output(),
            update,
        )?;
    }
    Ok(())
}

// ============================================================================
// macOS Implementation
// ============================================================================

#[cfg(target_os = "macos")]
fn login_keychain() -> String {
    format!(
        "{}/Library/Keychains/login.keychain-db",
        std::env::var("HOME").unwrap_or_default()
    )
}

#[cfg(target_os = "macos")]
fn is_trusted_macos(anchor: &TrustAnchor) -> Result<bool, TrustStoreError> {
    let output = Command::new("security")
        .args(["find-certificate", "-a", "-Z", "-c", anchor.display_name()])
        .output()?;
    if !output.status.success() {
        return Ok(false);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let fingerprint = anchor.fingerprint().to_uppercase();
    Ok(stdout
        .lines()
        .filter_map(|line| line.strip_prefix("SHA-256 hash: "))
        .any(|hash| hash.trim() == fingerprint))
}

#[cfg(target_os = "macos")]
fn install_macos(pem_path: &Path) -> Result<(), InstallError> {
    let keychain = login_keychain();
    let output = Command::new("security")
        .args(["add-trusted-cert", "-r", "trustRoot", "-k", &keychain])
        .arg(pem_path)
        .output();
    classify(output, "security")
}

#[cfg(target_os = "macos")]
fn uninstall_macos(anchor: &TrustAnchor) -> Result<(), InstallError> {
    let output = Command::new("security")
        .args(["delete-certificate", "-c", anchor.display_name(), "-t"])
        .output();
    classify(output, "security")
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Prints every certificate in the current user Root store as base64 DER.
#[cfg(target_os = "windows")]
const WINDOWS_LIST_ROOTS: &str =
    r#"Get-ChildItem Cert:\CurrentUser\Root | ForEach-Object { [Convert]::ToBase64String($_.RawData) }"#;

#[cfg(target_os = "windows")]
fn is_trusted_windows(anchor: &TrustAnchor) -> Result<bool, TrustStoreError> {
    use std::os::windows::process::CommandExt;

    let output = Command::new("powershell")
        .args([
            "-NoProfile",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
            WINDOWS_LIST_ROOTS,
        ])
        .creation_flags(CREATE_NO_WINDOW)
        .output()?;
    if !output.status.success() {
        return Ok(false);
    }
    Ok(listing_contains(
        &String::from_utf8_lossy(&output.stdout),
        anchor.der(),
    ))
}

#[cfg(target_os = "windows")]
fn install_windows(pem_path: &Path) -> Result<(), InstallError> {
    use std::os::windows::process::CommandExt;

    let output = Command::new("certutil")
        .args(["-addstore", "-user", "Root"])
        .arg(pem_path)
        .creation_flags(CREATE_NO_WINDOW)
        .output();
    classify(output, "certutil")
}

#[cfg(target_os = "windows")]
fn uninstall_windows(anchor: &TrustAnchor) -> Result<(), InstallError> {
    use std::os::windows::process::CommandExt;

    let output = Command::new("certutil")
        .args(["-delstore", "-user", "Root", anchor.display_name()])
        .creation_flags(CREATE_NO_WINDOW)
        .output();
    classify(output, "certutil")
}

/// Returns whether a listing of base64 DER certificates, one per line,
/// contains exactly `der`.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn listing_contains(listing: &str, der: &[u8]) -> bool {
    let expected = BASE64.encode(der);
    listing.lines().any(|line| line.trim() == expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_pem_creates_certificate_file() {
        let anchor = TrustAnchor::new(vec![1, 2, 3, 4], "tapwire-test", "Tapwire Test");
        let file = write_pem(&anchor).unwrap();

        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert!(contents.contains("BEGIN CERTIFICATE"));
        assert!(file
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(".crt"));
    }

    #[test]
    fn listing_matches_der_not_name() {
        let installed = TrustAnchor::new(vec![1, 2, 3], "tapwire", "Tapwire Root CA");
        let regenerated = TrustAnchor::new(vec![4, 5, 6], "tapwire", "Tapwire Root CA");
        let listing = format!(
            "{}\r\n{}\r\n",
            BASE64.encode([9, 9]),
            BASE64.encode(installed.der())
        );

        assert!(listing_contains(&listing, installed.der()));
        assert!(!listing_contains(&listing, regenerated.der()));
        assert!(!listing_contains("", installed.der()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn classify_maps_dismissal_to_declined() {
        let output = Command::new("sh")
            .args(["-c", "echo 'Request dismissed' >&2; exit 126"])
            .output();
        assert_eq!(classify(output, "pkexec"), Err(InstallError::UserDeclined));

        let output = Command::new("sh")
            .args(["-c", "echo 'disk full' >&2; exit 1"])
            .output();
        assert!(matches!(
            classify(output, "cp"),
            Err(InstallError::PlatformRejected(msg)) if msg.contains("disk full")
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unknown_alias_is_not_trusted() {
        let anchor = TrustAnchor::new(vec![9, 9, 9], "tapwire-never-installed", "Nope");
        assert!(!SystemTrustStore::new().is_ca_trusted(&anchor).unwrap());
    }
}
