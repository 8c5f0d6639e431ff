// End-to-end officer/member run on the in-memory radio and backend.

use anyhow::{Context, Result};
use attendbeacon_core::{
    BeaconScanner, CheckIn, MemoryAir, MemoryBackend, MemoryRadio, Organization, ProtocolConfig, Role,
    SessionManager, Tenant,
};
use colored::*;
use std::sync::Arc;
use uuid::Uuid;

pub struct SimulationReport {
    pub organization: Organization,
    pub digest: u16,
    pub event_id: Uuid,
    pub recorded: bool,
    pub duplicate_collapsed: bool,
    pub foreign_rejected: bool,
}

/// Run one full session: an officer broadcasts, a member of the same
/// organization checks in twice and a member of the other organization
/// hears the beacon but cannot use it.
pub async fn run(
    org: Organization,
    title: &str,
    ttl_secs: Option<u64>,
    config: ProtocolConfig,
) -> Result<SimulationReport> {
    let other = Organization::known()
        .iter()
        .copied()
        .find(|candidate| *candidate != org)
        .context("Registry has no second organization")?;

    let backend = MemoryBackend::default();
    let air = MemoryAir::new();
    let tenant = Tenant::new(backend.register_organization(org), org);
    let other_tenant = Tenant::new(backend.register_organization(other), other);

    let officer_id = Uuid::new_v4();
    let member_id = Uuid::new_v4();
    let outsider_id = Uuid::new_v4();
    backend.add_member(officer_id, tenant.org_id, Role::Officer);
    backend.add_member(member_id, tenant.org_id, Role::Member);
    backend.add_member(outsider_id, other_tenant.org_id, Role::Member);

    let device = |user: Uuid| -> Result<(SessionManager, Arc<MemoryRadio>)> {
        let radio = Arc::new(air.device());
        let manager = SessionManager::new(
            Arc::new(backend.as_user(user)),
            radio.clone(),
            config.clone(),
        )?;
        Ok((manager, radio))
    };
    let (officer, _) = device(officer_id)?;
    let (member, member_radio) = device(member_id)?;
    let (outsider, outsider_radio) = device(outsider_id)?;

    println!("{}", "Officer".bold());
    let session = officer.create_session(tenant, title, ttl_secs).await?;
    println!(
        "  {} Session created: {} (token {}, expires {})",
        "✓".green(),
        session.title.bright_cyan(),
        session.token.redacted(),
        session.expires_at.format("%H:%M:%S UTC")
    );
    let handle = officer.start_broadcast(&session).await?;
    let payload = handle.payload();
    println!(
        "  {} Broadcasting {} major={} minor={}",
        "✓".green(),
        payload.identifier,
        payload.major,
        payload.minor
    );

    println!();
    println!("{}", format!("Member ({})", org.slug()).bold());
    let scanner = BeaconScanner::new(member_radio, org, &config)?;
    let mut scan = scanner.start().await?;
    let wait = config.scan_poll_interval() * 3;
    let detection = tokio::time::timeout(wait, scan.recv())
        .await
        .context("No beacon detected")?
        .context("Scanner stopped before detecting a beacon")?;
    scan.stop().await?;
    println!(
        "  {} Detected digest {} at ~{:.1} m",
        "✓".green(),
        detection.digest,
        detection.estimate_distance_m()
    );

    let (recorded, duplicate_collapsed) = match member.check_in(tenant, &detection).await? {
        CheckIn::Recorded { session: info, result } => {
            println!(
                "  {} Attendance recorded for {}",
                "✓".green(),
                info.event_title.bright_cyan()
            );
            let again = member
                .add_attendance(&session.token)
                .await
                .context("Duplicate submission failed")?;
            let collapsed = again.success && again.attendance_id == result.attendance_id;
            println!("  {} Duplicate submission collapsed", mark(collapsed));
            (true, collapsed)
        }
        CheckIn::Rejected { result, .. } => {
            println!(
                "  {} Attendance refused: {}",
                "✗".red(),
                result.error.unwrap_or_default()
            );
            (false, false)
        }
        CheckIn::NoSession => {
            println!("  {} No session matched the beacon", "✗".red());
            (false, false)
        }
    };

    println!();
    println!("{}", format!("Member ({})", other.slug()).bold());
    let foreign_scanner = BeaconScanner::new(outsider_radio, other, &config)?;
    let mut foreign_scan = foreign_scanner.start().await?;
    let heard = tokio::time::timeout(wait, foreign_scan.recv()).await.ok().flatten();
    foreign_scan.stop().await?;
    let foreign_attempt = outsider.add_attendance(&session.token).await?;
    let foreign_rejected = heard.is_none() && !foreign_attempt.success;
    println!(
        "  {} Beacon ignored and direct submission refused",
        mark(foreign_rejected)
    );

    officer.stop_broadcast(&handle).await?;

    Ok(SimulationReport {
        organization: org,
        digest: payload.minor,
        event_id: session.event_id,
        recorded,
        duplicate_collapsed,
        foreign_rejected,
    })
}

fn mark(ok: bool) -> ColoredString {
    if ok {
        "✓".green()
    } else {
        "✗".red()
    }
}
