//! Android USB tunnel through `adb forward`

use std::process::{Command, Output};

use tracing::{debug, info, warn};

use crate::error::TunnelError;

/// Environment variable selecting one of several attached devices
pub const SERIAL_ENV: &str = "ANDROID_SERIAL";

/// Check that a usable device is attached, then forward `port` to it.
///
/// Once this succeeds, the phone is reachable at `127.0.0.1:port`.
pub fn forward(port: u16) -> Result<(), TunnelError> {
    let serial = std::env::var(SERIAL_ENV).ok().filter(|s| !s.is_empty());

    run_adb(&["start-server"])?;
    let devices = run_adb(&["devices"])?;
    let listing = String::from_utf8_lossy(&devices.stdout);

    match parse_adb_devices(&listing, serial.as_deref()) {
        Ok(device) => info!("Using adb device {}", device),
        Err(TunnelError::Offline) => {
            // A stale server keeps reporting the device offline
            let _ = Command::new("adb").arg("kill-server").output();
            return Err(TunnelError::Offline);
        }
        Err(e) => return Err(e),
    }

    let spec = format!("tcp:{}", port);
    let output = Command::new("adb")
        .args(["forward", &spec, &spec])
        .output()
        .map_err(|e| TunnelError::ForwardFailed(e.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!("adb forward failed: {}", stderr);
        return Err(TunnelError::ForwardFailed(stderr));
    }

    debug!("adb forward tcp:{} established", port);
    Ok(())
}

fn run_adb(args: &[&str]) -> Result<Output, TunnelError> {
    let output = Command::new("adb")
        .args(args)
        .output()
        .map_err(|e| TunnelError::LoadError(format!("adb {}: {}", args.join(" "), e)))?;
    if !output.status.success() {
        return Err(TunnelError::LoadError(format!(
            "adb {} exited with {}",
            args.join(" "),
            output.status
        )));
    }
    Ok(output)
}

/// Pick a device from `adb devices` output.
///
/// The first listed device decides the outcome, or the one named by `serial`.
/// Returns its serial.
pub fn parse_adb_devices(listing: &str, serial: Option<&str>) -> Result<String, TunnelError> {
    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of") || line.starts_with('*') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(id), Some(state)) = (parts.next(), parts.next()) else {
            continue;
        };
        if serial.is_some_and(|wanted| wanted != id) {
            continue;
        }

        return match state {
            "offline" => Err(TunnelError::Offline),
            "unauthorized" => Err(TunnelError::Unauthorized),
            "device" if !id.contains("??") => Ok(id.to_string()),
            _ => continue,
        };
    }
    Err(TunnelError::NoDevices)
}
