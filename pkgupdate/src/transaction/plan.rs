// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! Plan computation: turn resolved install/remove lists into the
//! ordered step sequence, or report a fatal collision.
//!
//! Steps are grouped by lifecycle phase; within a phase packages are
//! ordered alphabetically so plans are reproducible. Unpacking and
//! collision checking run before any destructive step; upgrades
//! contribute removal steps for the outgoing version ahead of the
//! install steps for the incoming one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::debug;
use thiserror::Error;

use crate::package::{Name, Package, Phase};
use crate::Database;

/// One atomic unit of work the engine commits to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Unpack { package: Name },
    CheckCollisions { package: Name },
    Script { package: Name, phase: Phase },
    MergeFiles { package: Name },
    RemoveFiles { package: Name, files: Vec<PathBuf> },
    UpdateDb { package: Name, transition: DbTransition },
    Cleanup { package: Name },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbTransition {
    Installed,
    Removed,
}

/// A path claimed by more than one owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub path: PathBuf,
    pub claimants: Vec<Name>,
}

/// Compute the ordered step sequence for the resolved operation lists
pub fn compute(installs: &[Package], removes: &[Name], db: &Database) -> Result<Vec<Step>, Error> {
    let install_names: Vec<&Name> = installs.iter().map(|p| &p.meta.name).sorted().collect();
    let remove_names: Vec<&Name> = removes.iter().sorted().collect();

    for name in &remove_names {
        if db.get(name).is_none() {
            return Err(Error::NotInstalled((*name).clone()));
        }
    }

    // Upgrades: incoming packages replacing an installed version
    let upgrades: Vec<&Name> = install_names
        .iter()
        .copied()
        .filter(|name| db.get(name).is_some())
        .collect();

    detect_collisions(installs, &remove_names, &upgrades, db)?;

    let by_name: BTreeMap<&Name, &Package> =
        installs.iter().map(|p| (&p.meta.name, p)).collect();

    // All packages losing their installed version, alphabetized
    let mut outgoing: Vec<&Name> = remove_names.iter().copied().chain(upgrades).collect();
    outgoing.sort();
    outgoing.dedup();

    let mut steps = Vec::new();

    for name in &install_names {
        steps.push(Step::Unpack {
            package: (*name).clone(),
        });
    }
    for name in &install_names {
        steps.push(Step::CheckCollisions {
            package: (*name).clone(),
        });
    }

    for name in &outgoing {
        steps.push(Step::Script {
            package: (*name).clone(),
            phase: Phase::PreRemove,
        });
    }
    for name in &outgoing {
        let entry = db.get(name).expect("validated above");
        let files = removable_files(entry, by_name.get(*name).copied());
        steps.push(Step::RemoveFiles {
            package: (*name).clone(),
            files,
        });
    }
    for name in &outgoing {
        steps.push(Step::Script {
            package: (*name).clone(),
            phase: Phase::PostRemove,
        });
    }
    for name in &outgoing {
        steps.push(Step::UpdateDb {
            package: (*name).clone(),
            transition: DbTransition::Removed,
        });
    }

    for name in &install_names {
        steps.push(Step::Script {
            package: (*name).clone(),
            phase: Phase::PreInstall,
        });
    }
    for name in &install_names {
        steps.push(Step::MergeFiles {
            package: (*name).clone(),
        });
    }
    for name in &install_names {
        steps.push(Step::UpdateDb {
            package: (*name).clone(),
            transition: DbTransition::Installed,
        });
    }
    for name in &install_names {
        steps.push(Step::Script {
            package: (*name).clone(),
            phase: Phase::PostInstall,
        });
    }
    for name in &install_names {
        steps.push(Step::Cleanup {
            package: (*name).clone(),
        });
    }

    Ok(steps)
}

/// Files to delete when a package's installed version goes away.
/// During an upgrade, declared conffiles survive for the merge policy
/// to reconcile.
fn removable_files(entry: &crate::db::Entry, incoming: Option<&Package>) -> Vec<PathBuf> {
    let is_upgrade = incoming.is_some();
    entry
        .files
        .iter()
        .filter(|path| !(is_upgrade && is_conffile_of(entry, path)))
        .cloned()
        .collect()
}

fn is_conffile_of(entry: &crate::db::Entry, path: &Path) -> bool {
    let absolute = Path::new("/").join(path);
    entry.conffiles.iter().any(|(conffile, _)| conffile == &absolute)
}

/// Build the provisional file-owner map and report unresolvable claims
fn detect_collisions(
    installs: &[Package],
    removes: &[&Name],
    upgrades: &[&Name],
    db: &Database,
) -> Result<(), Error> {
    // Installed ownership, minus packages losing their version
    let mut owners: HashMap<&Path, &Name> = HashMap::new();
    for entry in db.iter() {
        let name = &entry.meta.name;
        if removes.contains(&name) || upgrades.contains(&name) {
            continue;
        }
        for file in &entry.files {
            owners.insert(file.as_path(), name);
        }
    }

    let mut incoming: HashMap<&Path, &Name> = HashMap::new();
    let mut collisions = Vec::new();

    let mut sorted: Vec<&Package> = installs.iter().collect();
    sorted.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));

    for package in sorted {
        let name = &package.meta.name;
        for file in &package.files {
            if let Some(previous) = incoming.insert(file.as_path(), name) {
                collisions.push(Collision {
                    path: file.clone(),
                    claimants: vec![previous.clone(), name.clone()],
                });
                continue;
            }

            if let Some(owner) = owners.get(file.as_path()) {
                let entry = db.get(owner).expect("owner is installed");
                if is_conffile_of(entry, file) {
                    // Conffile overlap resolves through the merge policy
                    debug!(
                        "Conffile {} of {owner} also provided by {name}",
                        file.display()
                    );
                } else {
                    collisions.push(Collision {
                        path: file.clone(),
                        claimants: vec![(*owner).clone(), name.clone()],
                    });
                }
            }
        }
    }

    if collisions.is_empty() {
        Ok(())
    } else {
        Err(Error::Collisions(collisions))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("package {0} is not installed")]
    NotInstalled(Name),
    #[error("file collisions: {}", render_collisions(.0))]
    Collisions(Vec<Collision>),
}

fn render_collisions(collisions: &[Collision]) -> String {
    collisions
        .iter()
        .map(|collision| {
            let claimants: Vec<_> = collision.claimants.iter().map(ToString::to_string).collect();
            format!("{} ({})", collision.path.display(), claimants.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod test {
    use crate::db::Entry;
    use crate::package::{Meta, State};

    use super::*;

    fn meta(name: &str, version: &str) -> Meta {
        Meta {
            name: Name::from(name),
            version: version.to_string(),
            architecture: "all".to_string(),
            depends: vec![],
            conflicts: vec![],
            filename: None,
            sha256: None,
            size: None,
        }
    }

    fn package(name: &str, files: &[&str]) -> Package {
        Package {
            meta: meta(name, "1.0"),
            archive: PathBuf::from("/dev/null"),
            files: files.iter().map(PathBuf::from).collect(),
            conffiles: vec![],
        }
    }

    fn installed(db: &mut Database, name: &str, files: &[&str], conffiles: &[&str]) {
        db.insert(Entry {
            meta: meta(name, "0.9"),
            state: State::Installed,
            conffiles: conffiles
                .iter()
                .map(|path| (PathBuf::from(format!("/{path}")), "hash".to_string()))
                .collect(),
            files: files.iter().map(PathBuf::from).collect(),
        });
    }

    #[test]
    fn phases_are_alphabetized() {
        let db = Database::default();
        let installs = vec![
            package("zsh", &["usr/bin/zsh"]),
            package("bash", &["usr/bin/bash"]),
        ];

        let steps = compute(&installs, &[], &db).unwrap();

        assert_eq!(
            steps[..4],
            [
                Step::Unpack { package: Name::from("bash") },
                Step::Unpack { package: Name::from("zsh") },
                Step::CheckCollisions { package: Name::from("bash") },
                Step::CheckCollisions { package: Name::from("zsh") },
            ]
        );
        assert_eq!(
            *steps.last().unwrap(),
            Step::Cleanup { package: Name::from("zsh") }
        );
    }

    #[test]
    fn removal_sequence() {
        let mut db = Database::default();
        installed(&mut db, "old", &["usr/bin/old"], &[]);

        let steps = compute(&[], &[Name::from("old")], &db).unwrap();
        assert_eq!(
            steps,
            vec![
                Step::Script { package: Name::from("old"), phase: Phase::PreRemove },
                Step::RemoveFiles {
                    package: Name::from("old"),
                    files: vec![PathBuf::from("usr/bin/old")],
                },
                Step::Script { package: Name::from("old"), phase: Phase::PostRemove },
                Step::UpdateDb { package: Name::from("old"), transition: DbTransition::Removed },
            ]
        );
    }

    #[test]
    fn upgrade_is_remove_then_install() {
        let mut db = Database::default();
        installed(&mut db, "tool", &["usr/bin/tool", "etc/tool.conf"], &["etc/tool.conf"]);

        let installs = vec![package("tool", &["usr/bin/tool", "etc/tool.conf"])];
        let steps = compute(&installs, &[], &db).unwrap();

        let removal = steps
            .iter()
            .position(|s| matches!(s, Step::RemoveFiles { .. }))
            .unwrap();
        let merge = steps
            .iter()
            .position(|s| matches!(s, Step::MergeFiles { .. }))
            .unwrap();
        assert!(removal < merge);

        // Conffiles survive the upgrade removal
        let Step::RemoveFiles { files, .. } = &steps[removal] else {
            unreachable!()
        };
        assert_eq!(files, &[PathBuf::from("usr/bin/tool")]);
    }

    #[test]
    fn incoming_collision_is_fatal() {
        let db = Database::default();
        let installs = vec![
            package("first", &["usr/bin/shared"]),
            package("second", &["usr/bin/shared"]),
        ];

        let Err(Error::Collisions(collisions)) = compute(&installs, &[], &db) else {
            panic!("collision expected");
        };
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].path, PathBuf::from("usr/bin/shared"));
        assert_eq!(
            collisions[0].claimants,
            vec![Name::from("first"), Name::from("second")]
        );
    }

    #[test]
    fn installed_collision_resolved_by_removal() {
        let mut db = Database::default();
        installed(&mut db, "holder", &["usr/bin/shared"], &[]);

        let installs = vec![package("incoming", &["usr/bin/shared"])];

        assert!(matches!(
            compute(&installs, &[], &db),
            Err(Error::Collisions(_))
        ));
        // Removing the holder in the same transaction resolves the claim
        assert!(compute(&installs, &[Name::from("holder")], &db).is_ok());
    }

    #[test]
    fn conffile_overlap_is_not_a_collision() {
        let mut db = Database::default();
        installed(&mut db, "holder", &["etc/shared.conf"], &["etc/shared.conf"]);

        let installs = vec![package("incoming", &["etc/shared.conf"])];
        assert!(compute(&installs, &[], &db).is_ok());
    }

    #[test]
    fn removing_absent_package_fails() {
        let db = Database::default();
        assert!(matches!(
            compute(&[], &[Name::from("ghost")], &db),
            Err(Error::NotInstalled(_))
        ));
    }
}
