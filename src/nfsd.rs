//! Kernel NFS server lifecycle glue.
//!
//! Brings the in-container NFSv3 stack up before the controller starts and
//! tears it down on shutdown. The ganesha variant manages its own daemon and
//! never calls into here.

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Start rpcbind, mountd, nfsd and statd. Any failure here is fatal to
/// startup.
pub async fn start() -> Result<()> {
    info!("starting NFS");

    // rpcbind may already be running.
    if run("/usr/sbin/rpcinfo", &["127.0.0.1"]).await.is_err() {
        info!("starting rpcbind");
        run("/usr/sbin/rpcbind", &["-w"]).await?;
    }

    run("mount", &["-t", "nfsd", "nfsd", "/proc/fs/nfsd"]).await?;

    // NFSv3 only.
    run("/usr/sbin/rpc.mountd", &["-N2", "-V3", "-N4", "-N4.1"]).await?;
    // -G 10: the lowest grace period allowed.
    run(
        "/usr/sbin/rpc.nfsd",
        &["-G10", "-N2", "-V3", "-N4", "-N4.1", "2"],
    )
    .await?;
    run("/usr/sbin/rpc.statd", &["--no-notify"]).await?;

    info!("NFS started");
    Ok(())
}

/// Stop the NFS stack and unexport everything. Best effort; shutdown
/// proceeds past individual failures.
pub async fn stop() {
    info!("stopping NFS");

    for (program, args) in [
        ("/usr/sbin/rpc.nfsd", vec!["0"]),
        ("/usr/sbin/exportfs", vec!["-au"]),
        ("/usr/sbin/exportfs", vec!["-f"]),
        ("pkill", vec!["rpc.mountd"]),
        ("umount", vec!["/proc/fs/nfsd"]),
    ] {
        if let Err(e) = run(program, &args).await {
            warn!(error = %e, "NFS shutdown step failed");
        }
    }

    if let Err(e) = tokio::fs::write("/etc/exports", "").await {
        warn!(error = %e, "cleaning /etc/exports failed");
    }

    info!("NFS stopped");
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Internal(format!("spawn {program}: {e}")))?;
    if !output.status.success() {
        return Err(Error::Internal(format!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
