//! `strata lock` - inspect or clear a deployment lock

use clap::{Args, Subcommand};

use strata_lock::{lease_name, LockStatus};

use super::{confirm_destructive, Session};
use crate::Result;

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// Show who holds a deployment's lock
    Status(LockStatusArgs),
    /// Delete a deployment's lock regardless of its holder
    Release(LockReleaseArgs),
}

#[derive(Args, Debug)]
pub struct LockStatusArgs {
    /// Deployment name
    pub deployment: String,
}

#[derive(Args, Debug)]
pub struct LockReleaseArgs {
    /// Deployment name
    pub deployment: String,

    /// Skip the confirmation prompt
    #[arg(long, short)]
    pub yes: bool,
}

pub async fn run(cmd: LockCommand, session: &mut Session) -> Result<()> {
    match cmd {
        LockCommand::Status(args) => {
            let status = status(&args, session).await?;
            print_status(&args.deployment, status.as_ref());
            Ok(())
        }
        LockCommand::Release(args) => release(args, session).await,
    }
}

async fn status(args: &LockStatusArgs, session: &Session) -> Result<Option<LockStatus>> {
    let entry = session.config.deployment(&args.deployment)?;
    let book = session.address_book();
    let manager = session.lock_manager(&book, &entry.primary).await?;
    Ok(manager
        .status(&entry.namespace, &lease_name(&args.deployment))
        .await?)
}

fn print_status(deployment: &str, status: Option<&LockStatus>) {
    let Some(status) = status else {
        println!("Deployment '{deployment}' is not locked");
        return;
    };

    match &status.holder_info {
        Some(holder) => println!(
            "Held by:     {} on {} (session {})",
            holder.username, holder.hostname, holder.session_id
        ),
        None => println!("Held by:     {}", status.holder),
    }
    if let Some(at) = status.acquired_at {
        println!("Acquired:    {}", at.to_rfc3339());
    }
    if let Some(at) = status.renewed_at {
        println!("Renewed:     {}", at.to_rfc3339());
    }
    if let Some(at) = status.expires_at {
        let note = if status.expired { " (expired)" } else { "" };
        println!("Expires:     {}{}", at.to_rfc3339(), note);
    }
    println!("Transitions: {}", status.transitions);
}

async fn release(args: LockReleaseArgs, session: &mut Session) -> Result<()> {
    let entry = session.config.deployment(&args.deployment)?.clone();
    let book = session.address_book();
    let manager = session.lock_manager(&book, &entry.primary).await?;
    let name = lease_name(&args.deployment);

    if let Some(status) = manager.status(&entry.namespace, &name).await? {
        if !status.expired {
            println!("The lock is held by {}", status.holder);
        }
    }
    confirm_destructive(
        session,
        args.yes,
        &format!("Forcibly release the lock of '{}'?", args.deployment),
    )
    .await?;

    if manager.force_release(&entry.namespace, &name).await? {
        println!("Released the lock of '{}'", args.deployment);
    } else {
        println!("Deployment '{}' was not locked", args.deployment);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::commands::testing::Fixture;
    use crate::config::DeploymentEntry;
    use crate::Error;
    use strata_lock::{LeaseHolder, LockConfig};

    fn session(fixture: &Fixture) -> Session {
        let mut session = fixture.session();
        session.config.deployments.insert(
            "deploy".to_string(),
            DeploymentEntry {
                namespace: "ns1".to_string(),
                primary: "east".to_string(),
                clusters: vec!["east".to_string()],
            },
        );
        session
    }

    fn status_args() -> LockStatusArgs {
        LockStatusArgs {
            deployment: "deploy".to_string(),
        }
    }

    #[tokio::test]
    async fn status_names_the_holder() {
        let fixture = Fixture::new(&["east"]);
        let session = session(&fixture);
        assert!(status(&status_args(), &session).await.unwrap().is_none());

        let book = session.address_book();
        let handle = session
            .lock_manager(&book, "east")
            .await
            .unwrap()
            .acquire("ns1", "deploy-lock", "bob@desk/7")
            .await
            .unwrap();

        let current = status(&status_args(), &session).await.unwrap().unwrap();
        assert_eq!(current.holder, "bob@desk/7");
        assert_eq!(
            current.holder_info,
            Some(LeaseHolder::new("bob", "desk", "7"))
        );
        assert!(!current.expired);
        handle.release().await;
    }

    #[tokio::test]
    async fn release_clears_a_stuck_lock() {
        let fixture = Fixture::new(&["east"]);
        let mut session = session(&fixture);
        let book = session.address_book();
        let handle = session
            .lock_manager(&book, "east")
            .await
            .unwrap()
            .acquire("ns1", "deploy-lock", "bob@desk/7")
            .await
            .unwrap();

        release(
            LockReleaseArgs {
                deployment: "deploy".to_string(),
                yes: true,
            },
            &mut session,
        )
        .await
        .unwrap();
        assert!(fixture.cluster("east").lease("ns1", "deploy-lock").is_none());
        drop(handle);
    }

    #[tokio::test]
    async fn release_refuses_without_confirmation() {
        let fixture = Fixture::new(&["east"]);
        let mut session = session(&fixture);

        let err = release(
            LockReleaseArgs {
                deployment: "deploy".to_string(),
                yes: false,
            },
            &mut session,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn contended_command_times_out_naming_holder() {
        let fixture = Fixture::new(&["east"]);
        let session = session(&fixture).with_lock_config(LockConfig::new(
            Duration::from_secs(20),
            Duration::from_secs(5),
        ));
        let book = session.address_book();
        let holder = session
            .lock_manager(&book, "east")
            .await
            .unwrap()
            .acquire("ns1", "deploy-lock", "bob@desk/7")
            .await
            .unwrap();

        let err = session
            .with_lock(&book, "ns1", "deploy", "east", |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bob@desk/7"));
        assert_eq!(err.exit_code(), 3);
        holder.release().await;
    }
}
