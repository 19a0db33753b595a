//! `tunnelkit profile add|list|remove`

use crate::cli::{ProfileAddArgs, ProfileArgs, ProfileCommands, ProfileRemoveArgs};
use crate::output;
use chrono::Utc;
use colored::Colorize;
use std::path::PathBuf;
use tunnelkit::ids::new_id;
use tunnelkit::{Config, FileDirectory, InstanceDirectory, Profile, Result, TunnelkitError};

/// Run a profile subcommand.
pub fn run_profile(args: ProfileArgs, config: Option<PathBuf>) -> Result<()> {
    let directory = crate::open_directory(config)?;
    match args.command {
        ProfileCommands::Add(add_args) => run_add(&directory, add_args),
        ProfileCommands::List => {
            output::print_profiles(&directory.load()?.profiles);
            Ok(())
        }
        ProfileCommands::Remove(remove_args) => run_remove(&directory, remove_args),
    }
}

/// Pick the profile for `reference`, or the only saved one.
pub fn resolve_profile(config: &Config, reference: Option<&str>) -> Result<Profile> {
    if let Some(reference) = reference {
        return config
            .find_profile(reference)
            .cloned()
            .ok_or_else(|| TunnelkitError::InvalidConfig(format!("profile '{}' not found", reference)));
    }
    match config.profiles.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(TunnelkitError::InvalidConfig(
            "no profiles configured; add one with `tunnelkit profile add`".to_string(),
        )),
        _ => Err(TunnelkitError::InvalidConfig(
            "several profiles configured; name the one to use".to_string(),
        )),
    }
}

fn run_add(directory: &FileDirectory, args: ProfileAddArgs) -> Result<()> {
    let profile = build_profile(args, std::env::var("USER").ok())?;
    let mut saved = None;
    directory.update(&mut |cfg| {
        let mut profile = profile.clone();
        // same name: replace in place, keeping id and creation time
        if let Some(existing) = cfg.find_profile(&profile.name) {
            profile.id = existing.id.clone();
            profile.created_at = existing.created_at;
        }
        saved = Some(profile.clone());
        cfg.upsert_profile(profile);
        Ok(())
    })?;
    if let Some(profile) = saved {
        eprintln!(
            "{} {} ({})",
            "Saved profile".green(),
            profile.name.bold(),
            profile.id
        );
    }
    Ok(())
}

fn build_profile(args: ProfileAddArgs, default_user: Option<String>) -> Result<Profile> {
    let name = args.name.trim().to_string();
    if name.is_empty() {
        return Err(TunnelkitError::InvalidConfig("profile name is required".to_string()));
    }
    let host = args.host.trim().to_string();
    if host.is_empty() {
        return Err(TunnelkitError::InvalidConfig("profile host is required".to_string()));
    }
    if args.port == 0 {
        return Err(TunnelkitError::InvalidConfig("profile port must be 1-65535".to_string()));
    }
    let user = args
        .user
        .or(default_user)
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| TunnelkitError::InvalidConfig("profile user is required (--user)".to_string()))?;
    Ok(Profile {
        id: new_id()?,
        name,
        host,
        port: args.port,
        user,
        ssh_args: args.ssh_args,
        created_at: Utc::now(),
    })
}

fn run_remove(directory: &FileDirectory, args: ProfileRemoveArgs) -> Result<()> {
    let mut removed = None;
    directory.update(&mut |cfg| {
        let Some(profile) = cfg.find_profile(&args.profile).cloned() else {
            return Err(TunnelkitError::InvalidConfig(format!(
                "profile '{}' not found",
                args.profile
            )));
        };
        cfg.remove_profile(&profile.id);
        removed = Some(profile);
        Ok(())
    })?;
    if let Some(profile) = removed {
        eprintln!("Removed profile {} ({})", profile.name.bold(), profile.id);
    }
    Ok(())
}
