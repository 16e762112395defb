// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! The transaction engine.
//!
//! Executes a planned step sequence atomically from the user's
//! perspective. Destructive steps follow the record-before-act rule:
//! the journal record is synced before the filesystem changes, so a
//! crash at any point leaves enough on disk for the next start to
//! replay forward. Observational steps (collision checks, script exit
//! codes) record after the fact.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::db::{self, Entry};
use crate::fsutil;
use crate::installation::{lockfile, Hook, Lock};
use crate::package::{Name, Package, Phase, State};
use crate::signal::{self, Signal};
use crate::subprocess::Runner;
use crate::{hooks, runtime, Database, Installation};

pub use self::changelog::Changelog;
pub use self::journal::{Journal, Record};
pub use self::plan::{Collision, DbTransition, Step};

pub mod changelog;
pub mod journal;
pub mod plan;

/// Engine tunables, fed by the surrounding command surface
#[derive(Debug, Clone)]
pub struct Options {
    pub script_timeout: Duration,
    pub kill_timeout: Duration,
    /// Root-relative paths whose replacement demands a reboot
    pub reboot_triggers: Vec<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            script_timeout: Duration::from_secs(600),
            kill_timeout: Duration::from_secs(60),
            reboot_triggers: vec![PathBuf::from("boot"), PathBuf::from("lib/modules")],
        }
    }
}

/// What a completed transaction did
#[derive(Debug, Default)]
pub struct Summary {
    pub installed: Vec<Name>,
    pub removed: Vec<Name>,
    pub reboot_needed: bool,
}

/// A planned, locked transaction ready to apply
pub struct Transaction<'a> {
    installation: &'a Installation,
    db: &'a mut Database,
    options: Options,
    packages: BTreeMap<Name, Package>,
    outgoing: BTreeSet<Name>,
    old_versions: BTreeMap<Name, String>,
    steps: Vec<Step>,
    changelog: Changelog,
    merged_conffiles: BTreeMap<Name, Vec<(PathBuf, String)>>,
    reboot_needed: bool,
    in_critical_section: bool,
    _lock: Lock,
}

impl<'a> Transaction<'a> {
    /// Plan a transaction over resolved install/remove lists.
    ///
    /// Fails before any journal record is written: lock contention,
    /// unresolvable collisions and a pending recovery all abort here
    /// with the system untouched.
    pub fn new(
        installation: &'a Installation,
        db: &'a mut Database,
        installs: Vec<Package>,
        removes: Vec<Name>,
        options: Options,
    ) -> Result<Self, Error> {
        if Journal::exists(installation) {
            return Err(Error::RecoveryNeeded);
        }
        let lock = lockfile::acquire(installation.lock_path())?;

        let steps = plan::compute(&installs, &removes, db)?;

        let outgoing = removes
            .iter()
            .cloned()
            .chain(
                installs
                    .iter()
                    .filter(|p| db.get(&p.meta.name).is_some())
                    .map(|p| p.meta.name.clone()),
            )
            .collect();
        let old_versions = db
            .iter()
            .map(|entry| (entry.meta.name.clone(), entry.meta.version.clone()))
            .collect();
        let packages = installs
            .into_iter()
            .map(|package| (package.meta.name.clone(), package))
            .collect();

        Ok(Self {
            installation,
            db,
            options,
            packages,
            outgoing,
            old_versions,
            steps,
            changelog: Changelog::open(installation),
            merged_conffiles: BTreeMap::new(),
            reboot_needed: false,
            in_critical_section: false,
            _lock: lock,
        })
    }

    /// Execute all planned steps.
    ///
    /// A failure before the critical section cleans up after itself
    /// (staging and journal removed). A failure inside it leaves the
    /// journal in place and reports that recovery is mandatory.
    pub fn apply(mut self) -> Result<Summary, Error> {
        if let Err(error) = runtime::block_on(hooks::run(self.installation, Hook::PreUpdate, &[])) {
            warn!("Pre-update hooks failed: {error}");
        }

        let signals = signal::defer([Signal::SIGINT, Signal::SIGTERM])?;
        self.changelog.transaction_start();
        let mut journal = Journal::fresh(self.installation)?;

        let result = self.run_steps(&mut journal);
        drop(signals);

        match result {
            Ok(()) => {
                journal.finish(false)?;
                self.changelog.transaction_end();
                self.changelog.sync();

                if let Err(error) = runtime::block_on(hooks::run(
                    self.installation,
                    Hook::PostUpdate,
                    &[("SUCCESS", "true")],
                )) {
                    warn!("Post-update hooks failed: {error}");
                }
                if self.reboot_needed {
                    if let Err(error) = runtime::block_on(hooks::run(
                        self.installation,
                        Hook::RebootRequired,
                        &[],
                    )) {
                        warn!("Reboot-required hooks failed: {error}");
                    }
                }

                Ok(Summary {
                    installed: self.packages.keys().cloned().collect(),
                    removed: self
                        .outgoing
                        .iter()
                        .filter(|name| !self.packages.contains_key(name))
                        .cloned()
                        .collect(),
                    reboot_needed: self.reboot_needed,
                })
            }
            Err(error) => {
                self.changelog.sync();
                if let Err(error) = runtime::block_on(hooks::run(
                    self.installation,
                    Hook::PostUpdate,
                    &[("SUCCESS", "false")],
                )) {
                    warn!("Post-update hooks failed: {error}");
                }

                if self.in_critical_section {
                    // Journal stays on disk; the next start must replay it
                    drop(journal);
                    Err(Error::Critical(Box::new(error)))
                } else {
                    self.remove_staging_areas();
                    journal.discard()?;
                    Err(error)
                }
            }
        }
    }

    fn run_steps(&mut self, journal: &mut Journal) -> Result<(), Error> {
        let steps = std::mem::take(&mut self.steps);
        info!("Transaction of {} steps begins", steps.len());

        for step in steps {
            // A deferred interrupt aborts at the step boundary
            if signal::interrupted() {
                warn!("Interrupted, aborting at step boundary");
                return Err(Error::Interrupted);
            }

            if !self.in_critical_section {
                debug!("Entering transaction critical section");
                self.in_critical_section = true;
            }
            self.execute(step, journal)?;
        }

        Ok(())
    }

    fn execute(&mut self, step: Step, journal: &mut Journal) -> Result<(), Error> {
        match step {
            Step::Unpack { package } => self.unpack(&package, journal),
            Step::CheckCollisions { package } => self.check_collisions(&package, journal),
            Step::Script { package, phase } => self.run_script(&package, phase, journal),
            Step::RemoveFiles { package, files } => self.remove_files(&package, &files, journal),
            Step::MergeFiles { package } => self.merge_files(&package, journal),
            Step::UpdateDb { package, transition } => {
                self.update_db(&package, transition, journal)
            }
            Step::Cleanup { package } => self.cleanup(&package, journal),
        }
    }

    fn staging_dir(&self, name: &Name) -> PathBuf {
        self.installation.unpacked_dir().join(name.as_ref())
    }

    fn unpack(&mut self, name: &Name, journal: &mut Journal) -> Result<(), Error> {
        let package = &self.packages[name];
        let staging = self.staging_dir(name);
        debug!("Unpacking {name} into {}", staging.display());

        journal.write(&Record::Unpacked {
            package: name.to_string(),
            staging: staging.clone(),
        })?;

        fsutil::remove_recursive(&staging)?;
        ipk::unpack(&package.archive, &staging)?;
        Ok(())
    }

    fn check_collisions(&mut self, name: &Name, journal: &mut Journal) -> Result<(), Error> {
        let package = &self.packages[name];

        for file in &package.files {
            if let Some(owner) = self.db.owner_of(file) {
                if owner != name && !self.outgoing.contains(owner) {
                    return Err(Error::Collision {
                        path: file.clone(),
                        owner: owner.clone(),
                    });
                }
            }
        }

        journal.write(&Record::Checked {
            package: name.to_string(),
        })?;
        Ok(())
    }

    fn run_script(&mut self, name: &Name, phase: Phase, journal: &mut Journal) -> Result<(), Error> {
        let script = match phase {
            Phase::PreInstall | Phase::PostInstall => {
                self.staging_dir(name).join("control").join(phase.to_string())
            }
            Phase::PreRemove | Phase::PostRemove => {
                db::script_path(self.installation, name, phase)
            }
        };
        if !script.is_file() {
            return Ok(());
        }

        debug!("Running {phase} script of {name}");
        ensure_executable(&script);

        let output = runtime::block_on(
            Runner::new(&script)
                .env("ROOT_DIR", &self.installation.root)
                .current_dir(&self.installation.root)
                .timeout(self.options.script_timeout)
                .kill_timeout(self.options.kill_timeout)
                .run(),
        )?;

        let exit_code = output.termination.code();
        journal.write(&Record::Scripts {
            package: name.to_string(),
            phase,
            exit_code,
        })?;

        // A failing maintainer script is recorded, never fatal
        if !output.termination.success() {
            warn!("{phase} script of {name} exited with {exit_code}");
            self.changelog
                .script_fail(name.as_ref(), phase, exit_code, &output.combined());
        }

        Ok(())
    }

    fn remove_files(
        &mut self,
        name: &Name,
        files: &[PathBuf],
        journal: &mut Journal,
    ) -> Result<(), Error> {
        debug!("Removing files of {name}");
        journal.write(&Record::Moved {
            package: name.to_string(),
        })?;

        self.db.set_state(name, State::HalfRemoved);
        for file in files {
            fsutil::remove_recursive(&self.installation.root.join(file))?;
        }
        Ok(())
    }

    fn merge_files(&mut self, name: &Name, journal: &mut Journal) -> Result<(), Error> {
        debug!("Merging files of {name}");
        journal.write(&Record::Moved {
            package: name.to_string(),
        })?;

        let package = self.packages[name].clone();
        let staging_data = self.staging_dir(name).join("data");
        let mut conffiles = Vec::new();

        let mut files = package.files.clone();
        files.sort();

        for file in &files {
            let staged = staging_data.join(file);
            let target = self.installation.root.join(file);

            if self
                .options
                .reboot_triggers
                .iter()
                .any(|trigger| file.starts_with(trigger))
            {
                self.reboot_needed = true;
            }

            if package.is_conffile(file) {
                let recorded = self.merge_conffile(name, file, &staged, &target)?;
                conffiles.push((Path::new("/").join(file), recorded));
                continue;
            }

            if !staged.exists() {
                // Already merged by an earlier, interrupted run
                debug!("Skipping already merged file: {}", file.display());
                continue;
            }

            if target.exists() && self.db.owner_of(file).is_none() {
                self.quarantine(file, &target)?;
            }

            if let Some(parent) = target.parent() {
                fsutil::mkdir_p(parent)?;
            }
            fsutil::move_path(&staged, &target)?;
        }

        self.merged_conffiles.insert(name.clone(), conffiles);
        Ok(())
    }

    /// Apply the conffile policy and return the hash to record.
    ///
    /// An on-disk copy identical to the incoming file resolves
    /// silently; divergent content is preserved and the incoming
    /// version lands beside it as `<path>.new`.
    fn merge_conffile(
        &mut self,
        name: &Name,
        file: &Path,
        staged: &Path,
        target: &Path,
    ) -> Result<String, Error> {
        if !staged.exists() {
            // Replay after interruption; trust the on-disk state
            return Ok(hash_file_hex(target).unwrap_or_default());
        }

        let incoming = hash_file_hex(staged)?;
        if !target.exists() {
            if let Some(parent) = target.parent() {
                fsutil::mkdir_p(parent)?;
            }
            fsutil::move_path(staged, target)?;
            return Ok(incoming);
        }

        let current = hash_file_hex(target)?;
        if current == incoming {
            debug!("Conffile {} unchanged, keeping user copy", file.display());
            fsutil::remove_recursive(staged)?;
            return Ok(incoming);
        }

        let dotnew = target.with_extension(extension_with_new(target));
        info!(
            "Conffile {} modified, writing incoming version as {}",
            file.display(),
            dotnew.display()
        );
        self.changelog.package(
            &format!("{name}:{}", file.display()),
            Some("preserved"),
            Some("written as .new"),
        );
        fsutil::move_path(staged, &dotnew)?;

        // The user copy stays authoritative; record its hash
        Ok(current)
    }

    /// Move an unowned obstruction into the collision quarantine
    fn quarantine(&mut self, file: &Path, target: &Path) -> Result<(), Error> {
        let quarantined = self.installation.collided_dir().join(file);
        warn!(
            "Path {} is in the way, quarantining to {}",
            target.display(),
            quarantined.display()
        );
        if let Some(parent) = quarantined.parent() {
            fsutil::mkdir_p(parent)?;
        }
        fsutil::move_path(target, &quarantined)?;
        Ok(())
    }

    fn update_db(
        &mut self,
        name: &Name,
        transition: DbTransition,
        journal: &mut Journal,
    ) -> Result<(), Error> {
        match transition {
            DbTransition::Removed => {
                // An upgraded package keeps its entry; the incoming
                // version's UpdateDb replaces it
                if !self.packages.contains_key(name) {
                    self.db.remove(name);
                    self.db.write(self.installation)?;
                    db::remove_info(self.installation, name)?;
                    self.changelog.package(
                        name.as_ref(),
                        self.old_versions.get(name).map(String::as_str),
                        None,
                    );
                    journal.write(&Record::Cleaned {
                        package: name.to_string(),
                    })?;
                }
            }
            DbTransition::Installed => {
                let package = &self.packages[name];
                let control_dir = self.staging_dir(name).join("control");

                for phase in [
                    Phase::PreInstall,
                    Phase::PostInstall,
                    Phase::PreRemove,
                    Phase::PostRemove,
                ] {
                    db::install_script(self.installation, name, phase, &control_dir)?;
                }
                db::write_info(
                    self.installation,
                    name,
                    &package.files,
                    &package.conffiles,
                )?;

                self.db.insert(Entry {
                    meta: package.meta.clone(),
                    state: State::Installed,
                    conffiles: self.merged_conffiles.remove(name).unwrap_or_default(),
                    files: package.files.clone(),
                });
                self.db.write(self.installation)?;

                self.changelog.package(
                    name.as_ref(),
                    self.old_versions.get(name).map(String::as_str),
                    Some(&package.meta.version),
                );
            }
        }
        Ok(())
    }

    fn cleanup(&mut self, name: &Name, journal: &mut Journal) -> Result<(), Error> {
        fsutil::remove_recursive(&self.staging_dir(name))?;
        journal.write(&Record::Cleaned {
            package: name.to_string(),
        })?;
        Ok(())
    }

    fn remove_staging_areas(&self) {
        for name in self.packages.keys() {
            let _ = fsutil::remove_recursive(&self.staging_dir(name));
        }
    }
}

fn ensure_executable(script: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(script, std::fs::Permissions::from_mode(0o755));
}

fn extension_with_new(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.new"),
        None => "new".to_string(),
    }
}

fn hash_file_hex(path: &Path) -> Result<String, Error> {
    use std::io::Read;

    let mut file = std::fs::File::open(path).map_err(|e| Error::Hash(path.to_path_buf(), e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::Hash(path.to_path_buf(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Replay the journal left by an interrupted transaction and bring the
/// system to a consistent state.
///
/// Packages with an `UNPACKED` record but no `CLEANED` resume from
/// their staging area: file merges replay idempotently (a file whose
/// target already matches is skipped), the database entry is written
/// and staging removed. Maintainer scripts are not re-run; their
/// completed executions are already journaled. Removals recorded as
/// `MOVED` without `CLEANED` re-run their idempotent deletion.
pub fn recover(installation: &Installation, db: &mut Database) -> Result<Summary, Error> {
    let _lock = lockfile::acquire(installation.lock_path())?;

    let Some((journal, records)) = Journal::recover(installation)? else {
        debug!("No journal, nothing to recover");
        return Ok(Summary::default());
    };
    info!("Replaying journal of {} records", records.len());

    #[derive(Default)]
    struct Progress {
        staging: Option<PathBuf>,
        moved: bool,
        cleaned: bool,
    }

    let mut progress: BTreeMap<String, Progress> = BTreeMap::new();
    for record in &records {
        match record {
            Record::Unpacked { package, staging } => {
                progress.entry(package.clone()).or_default().staging = Some(staging.clone());
            }
            Record::Moved { package } => {
                progress.entry(package.clone()).or_default().moved = true;
            }
            Record::Cleaned { package } => {
                progress.entry(package.clone()).or_default().cleaned = true;
            }
            _ => {}
        }
    }

    let mut journal = journal;
    let mut changelog = Changelog::open(installation);
    let mut summary = Summary::default();

    for (package, state) in progress {
        let name = Name::from(package.as_str());
        if state.cleaned {
            continue;
        }

        match state.staging {
            Some(staging) if staging.is_dir() => {
                info!("Completing interrupted install of {name}");
                let old_version = db.get(&name).map(|entry| entry.meta.version.clone());

                let package = match staged_package(&staging, &name) {
                    Ok(package) => package,
                    Err(error) => {
                        // Unpack never completed; nothing was merged, so
                        // dropping the staging area undoes the whole step
                        warn!("Staging area of {name} is unreadable ({error}), dropping it");
                        fsutil::remove_recursive(&staging)?;
                        journal.write(&Record::Cleaned {
                            package: name.to_string(),
                        })?;
                        continue;
                    }
                };
                let conffiles = replay_merge(installation, &package, &staging.join("data"))?;

                let control_dir = staging.join("control");
                for phase in [
                    Phase::PreInstall,
                    Phase::PostInstall,
                    Phase::PreRemove,
                    Phase::PostRemove,
                ] {
                    db::install_script(installation, &name, phase, &control_dir)?;
                }
                db::write_info(installation, &name, &package.files, &package.conffiles)?;
                db.insert(Entry {
                    meta: package.meta.clone(),
                    state: State::Installed,
                    conffiles,
                    files: package.files.clone(),
                });
                db.write(installation)?;
                changelog.package(
                    name.as_ref(),
                    old_version.as_deref(),
                    Some(&package.meta.version),
                );

                fsutil::remove_recursive(&staging)?;
                journal.write(&Record::Cleaned {
                    package: name.to_string(),
                })?;
                summary.installed.push(name);
            }
            Some(staging) => {
                // Unpack was journaled but never finished; nothing was
                // merged, so dropping the staging area undoes it all
                warn!("Staging area {} is gone, dropping {name}", staging.display());
                let _ = fsutil::remove_recursive(&staging);
                journal.write(&Record::Cleaned {
                    package: name.to_string(),
                })?;
            }
            None if state.moved => {
                info!("Completing interrupted removal of {name}");
                if let Some(entry) = db.remove(&name) {
                    for file in &entry.files {
                        fsutil::remove_recursive(&installation.root.join(file))?;
                    }
                    db.write(installation)?;
                    db::remove_info(installation, &name)?;
                    changelog.package(name.as_ref(), Some(&entry.meta.version), None);
                }
                journal.write(&Record::Cleaned {
                    package: name.to_string(),
                })?;
                summary.removed.push(name);
            }
            None => {}
        }
    }

    journal.finish(false)?;
    changelog.transaction_end();
    changelog.sync();
    info!("Journal replay complete");

    Ok(summary)
}

/// Reconstruct a package from its staging area during recovery
fn staged_package(staging: &Path, name: &Name) -> Result<Package, Error> {
    let control = std::fs::read_to_string(staging.join("control/control"))
        .map_err(|e| Error::Read(staging.join("control/control"), e))?;
    let meta = crate::package::Meta::from_control(&control).map_err(crate::package::Error::from)?;

    if &meta.name != name {
        warn!("Staging area of {name} holds metadata for {}", meta.name);
    }

    let conffiles = match std::fs::read_to_string(staging.join("control/conffiles")) {
        Ok(listing) => listing
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| PathBuf::from(line.trim()))
            .collect(),
        Err(_) => Vec::new(),
    };

    let data = staging.join("data");
    let files = fsutil::dir_tree_list(&data, fsutil::TypeFilter::FILES)?
        .into_iter()
        .filter_map(|path| path.strip_prefix(&data).ok().map(Path::to_path_buf))
        .collect();

    Ok(Package {
        meta,
        archive: PathBuf::new(),
        files,
        conffiles,
    })
}

/// Idempotent merge used during replay: files whose target already
/// matches the staged content are skipped.
fn replay_merge(
    installation: &Installation,
    package: &Package,
    staging_data: &Path,
) -> Result<Vec<(PathBuf, String)>, Error> {
    let mut conffiles = Vec::new();

    for file in &package.files {
        let staged = staging_data.join(file);
        let target = installation.root.join(file);

        if package.is_conffile(file) {
            let recorded = if staged.exists() && target.exists() {
                let current = hash_file_hex(&target)?;
                if current != hash_file_hex(&staged)? {
                    let dotnew = target.with_extension(extension_with_new(&target));
                    fsutil::move_path(&staged, &dotnew)?;
                } else {
                    fsutil::remove_recursive(&staged)?;
                }
                current
            } else if staged.exists() {
                if let Some(parent) = target.parent() {
                    fsutil::mkdir_p(parent)?;
                }
                fsutil::move_path(&staged, &target)?;
                hash_file_hex(&target)?
            } else {
                hash_file_hex(&target).unwrap_or_default()
            };
            conffiles.push((Path::new("/").join(file), recorded));
            continue;
        }

        if !staged.exists() {
            continue;
        }
        if target.exists() && hash_file_hex(&target).ok() == hash_file_hex(&staged).ok() {
            fsutil::remove_recursive(&staged)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fsutil::mkdir_p(parent)?;
        }
        fsutil::move_path(&staged, &target)?;
    }

    Ok(conffiles)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unfinished journal exists, recovery is needed first")]
    RecoveryNeeded,
    #[error("transaction lock")]
    Lock(#[from] lockfile::Error),
    #[error("plan")]
    Plan(#[from] plan::Error),
    #[error("journal")]
    Journal(#[from] journal::Error),
    #[error("filesystem")]
    Fs(#[from] fsutil::Error),
    #[error("database")]
    Db(#[from] db::Error),
    #[error("package")]
    Package(#[from] crate::package::Error),
    #[error("archive")]
    Archive(#[from] ipk::Error),
    #[error("subprocess")]
    Subprocess(#[from] crate::subprocess::Error),
    #[error("signals")]
    Signal(#[from] signal::Error),
    #[error("interrupted")]
    Interrupted,
    #[error("collision at {path:?}: owned by {owner}")]
    Collision { path: PathBuf, owner: Name },
    #[error("hashing {0}")]
    Hash(PathBuf, #[source] std::io::Error),
    #[error("reading {0}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("transaction failed inside critical section, run recovery: {0}")]
    Critical(#[source] Box<Error>),
}

impl Error {
    /// Process exit code: 2 when the journal demands recovery
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Critical(_) | Error::RecoveryNeeded => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write as _;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tar::{Builder, Header};

    use super::*;

    struct Fixture {
        name: &'static str,
        version: &'static str,
        files: Vec<(&'static str, Vec<u8>, u32)>,
        conffiles: Vec<&'static str>,
        scripts: Vec<(Phase, String)>,
    }

    impl Fixture {
        fn new(name: &'static str, version: &'static str) -> Self {
            Self {
                name,
                version,
                files: Vec::new(),
                conffiles: Vec::new(),
                scripts: Vec::new(),
            }
        }

        fn file(mut self, path: &'static str, body: &[u8]) -> Self {
            self.files.push((path, body.to_vec(), 0o644));
            self
        }

        fn conffile(mut self, path: &'static str, body: &[u8]) -> Self {
            self.files.push((path, body.to_vec(), 0o644));
            self.conffiles.push(path);
            self
        }

        fn script(mut self, phase: Phase, body: String) -> Self {
            self.scripts.push((phase, body));
            self
        }

        /// Build the archive in the download cache and parse it
        fn build(self, installation: &Installation) -> Package {
            let control_body = format!(
                "Package: {}\nVersion: {}\nArchitecture: all\n",
                self.name, self.version
            );

            let control = gz_tar(|builder| {
                file_entry(builder, "./control", 0o644, control_body.as_bytes());
                if !self.conffiles.is_empty() {
                    let listing: String = self
                        .conffiles
                        .iter()
                        .map(|path| format!("/{path}\n"))
                        .collect();
                    file_entry(builder, "./conffiles", 0o644, listing.as_bytes());
                }
                for (phase, body) in &self.scripts {
                    file_entry(builder, &format!("./{phase}"), 0o755, body.as_bytes());
                }
            });
            let data = gz_tar(|builder| {
                for (path, body, mode) in &self.files {
                    file_entry(builder, &format!("./{path}"), *mode, body);
                }
            });
            let outer = gz_tar(|builder| {
                file_entry(builder, "./debian-binary", 0o644, b"2.0\n");
                file_entry(builder, "./control.tar.gz", 0o644, &control);
                file_entry(builder, "./data.tar.gz", 0o644, &data);
            });

            let path = installation
                .download_dir()
                .join(format!("{}_{}.ipk", self.name, self.version));
            std::fs::write(&path, outer).unwrap();

            Package::from_archive(path).unwrap()
        }
    }

    fn file_entry(builder: &mut Builder<Vec<u8>>, name: &str, mode: u32, body: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(mode);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder.append_data(&mut header, name, body).unwrap();
    }

    fn gz_tar(build: impl FnOnce(&mut Builder<Vec<u8>>)) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        build(&mut builder);
        let plain = builder.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain).unwrap();
        encoder.finish().unwrap()
    }

    fn apply(
        installation: &Installation,
        db: &mut Database,
        installs: Vec<Package>,
        removes: Vec<Name>,
    ) -> Result<Summary, Error> {
        let _guard = runtime::init();
        Transaction::new(installation, db, installs, removes, Options::default())?.apply()
    }

    #[test]
    fn install_transaction() {
        let root = tempfile::tempdir().unwrap();
        let installation = Installation::open(root.path());
        let mut db = Database::open(&installation).unwrap();

        let package = Fixture::new("demo", "1.0")
            .file("usr/bin/demo", b"#!/bin/sh\n")
            .conffile("etc/demo.conf", b"setting=1\n")
            .script(
                Phase::PostInstall,
                format!("#!/bin/sh\ntouch {}/postinst-ran\n", root.path().display()),
            )
            .build(&installation);

        let summary = apply(&installation, &mut db, vec![package], vec![]).unwrap();
        assert_eq!(summary.installed, vec![Name::from("demo")]);

        // Files merged into the root
        assert_eq!(
            std::fs::read(root.path().join("usr/bin/demo")).unwrap(),
            b"#!/bin/sh\n"
        );
        assert_eq!(
            std::fs::read(root.path().join("etc/demo.conf")).unwrap(),
            b"setting=1\n"
        );

        // Database updated, scripts installed, staging and journal gone
        let reloaded = Database::open(&installation).unwrap();
        let entry = reloaded.get(&Name::from("demo")).unwrap();
        assert_eq!(entry.state, State::Installed);
        assert_eq!(entry.conffiles.len(), 1);
        assert!(installation.info_dir().join("demo.list").is_file());
        assert!(installation.info_dir().join("demo.postinst").is_file());
        assert!(!Journal::exists(&installation));
        assert!(!installation.unpacked_dir().join("demo").exists());

        // Maintainer script actually ran
        assert!(root.path().join("postinst-ran").is_file());

        // Changelog carries the transition
        let changelog = std::fs::read_to_string(installation.changelog_path()).unwrap();
        assert!(changelog.contains("PKG\tdemo\t\t1.0"));
    }

    #[test]
    fn upgrade_preserves_modified_conffile() {
        let root = tempfile::tempdir().unwrap();
        let installation = Installation::open(root.path());
        let mut db = Database::open(&installation).unwrap();

        let v1 = Fixture::new("demo", "1.0")
            .file("usr/bin/demo", b"v1")
            .conffile("etc/demo.conf", b"stock v1\n")
            .build(&installation);
        apply(&installation, &mut db, vec![v1], vec![]).unwrap();

        // The user edits the conffile
        std::fs::write(root.path().join("etc/demo.conf"), b"user edited\n").unwrap();

        let v2 = Fixture::new("demo", "2.0")
            .file("usr/bin/demo", b"v2")
            .conffile("etc/demo.conf", b"stock v2\n")
            .build(&installation);
        apply(&installation, &mut db, vec![v2], vec![]).unwrap();

        // Binary replaced, user conffile preserved, incoming written as .new
        assert_eq!(std::fs::read(root.path().join("usr/bin/demo")).unwrap(), b"v2");
        assert_eq!(
            std::fs::read(root.path().join("etc/demo.conf")).unwrap(),
            b"user edited\n"
        );
        assert_eq!(
            std::fs::read(root.path().join("etc/demo.conf.new")).unwrap(),
            b"stock v2\n"
        );

        let reloaded = Database::open(&installation).unwrap();
        assert_eq!(reloaded.get(&Name::from("demo")).unwrap().meta.version, "2.0");
    }

    #[test]
    fn unmodified_conffile_is_replaced_silently() {
        let root = tempfile::tempdir().unwrap();
        let installation = Installation::open(root.path());
        let mut db = Database::open(&installation).unwrap();

        let v1 = Fixture::new("demo", "1.0")
            .conffile("etc/demo.conf", b"stock\n")
            .build(&installation);
        apply(&installation, &mut db, vec![v1], vec![]).unwrap();

        let v2 = Fixture::new("demo", "2.0")
            .conffile("etc/demo.conf", b"stock\n")
            .build(&installation);
        apply(&installation, &mut db, vec![v2], vec![]).unwrap();

        assert_eq!(
            std::fs::read(root.path().join("etc/demo.conf")).unwrap(),
            b"stock\n"
        );
        assert!(!root.path().join("etc/demo.conf.new").exists());
    }

    #[test]
    fn remove_transaction() {
        let root = tempfile::tempdir().unwrap();
        let installation = Installation::open(root.path());
        let mut db = Database::open(&installation).unwrap();

        let package = Fixture::new("doomed", "1.0")
            .file("usr/bin/doomed", b"bytes")
            .build(&installation);
        apply(&installation, &mut db, vec![package], vec![]).unwrap();
        assert!(root.path().join("usr/bin/doomed").exists());

        let summary = apply(&installation, &mut db, vec![], vec![Name::from("doomed")]).unwrap();
        assert_eq!(summary.removed, vec![Name::from("doomed")]);

        assert!(!root.path().join("usr/bin/doomed").exists());
        assert!(!installation.info_dir().join("doomed.list").exists());
        let reloaded = Database::open(&installation).unwrap();
        assert!(reloaded.get(&Name::from("doomed")).is_none());
        assert!(!Journal::exists(&installation));
    }

    #[test]
    fn script_failure_is_recorded_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let installation = Installation::open(root.path());
        let mut db = Database::open(&installation).unwrap();

        let package = Fixture::new("flaky", "1.0")
            .file("usr/bin/flaky", b"x")
            .script(
                Phase::PostInstall,
                "#!/bin/sh\necho going down >&2\nexit 7\n".to_string(),
            )
            .build(&installation);

        // The transaction still succeeds
        apply(&installation, &mut db, vec![package], vec![]).unwrap();
        assert!(root.path().join("usr/bin/flaky").exists());

        let changelog = std::fs::read_to_string(installation.changelog_path()).unwrap();
        assert!(changelog.contains("SCRIPT\tflaky\tpostinst\t7"));
        assert!(changelog.contains("|going down"));
    }

    #[test]
    fn pending_journal_refuses_new_transaction() {
        let root = tempfile::tempdir().unwrap();
        let installation = Installation::open(root.path());
        let mut db = Database::open(&installation).unwrap();

        let _journal = Journal::fresh(&installation).unwrap();
        let Err(error) = Transaction::new(&installation, &mut db, vec![], vec![], Options::default())
        else {
            panic!("planning must refuse a pending journal");
        };
        assert!(matches!(error, Error::RecoveryNeeded));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn recovery_completes_interrupted_install() {
        let _guard = runtime::init();
        let root = tempfile::tempdir().unwrap();
        let installation = Installation::open(root.path());
        let mut db = Database::open(&installation).unwrap();

        let package = Fixture::new("pkg1", "1.0")
            .file("usr/bin/pkg1", b"payload")
            .build(&installation);

        // The crash happened after the unpack step was journaled and
        // performed; trailing garbage simulates a torn later record
        let staging = installation.unpacked_dir().join("pkg1");
        let mut journal = Journal::fresh(&installation).unwrap();
        journal
            .write(&Record::Unpacked {
                package: "pkg1".to_string(),
                staging: staging.clone(),
            })
            .unwrap();
        drop(journal);
        ipk::unpack(&package.archive, &staging).unwrap();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(installation.journal_path())
            .unwrap();
        file.write_all(&[0xba, 0xad, 0xf0]).unwrap();
        drop(file);

        let summary = recover(&installation, &mut db).unwrap();
        assert_eq!(summary.installed, vec![Name::from("pkg1")]);

        // Install completed: file merged, database consistent, journal gone
        assert_eq!(
            std::fs::read(root.path().join("usr/bin/pkg1")).unwrap(),
            b"payload"
        );
        let reloaded = Database::open(&installation).unwrap();
        let entry = reloaded.get(&Name::from("pkg1")).unwrap();
        assert_eq!(entry.state, State::Installed);
        assert_eq!(entry.files, vec![PathBuf::from("usr/bin/pkg1")]);
        assert!(!Journal::exists(&installation));
        assert!(!staging.exists());
    }

    #[test]
    fn recovery_without_journal_is_noop() {
        let root = tempfile::tempdir().unwrap();
        let installation = Installation::open(root.path());
        let mut db = Database::open(&installation).unwrap();

        let summary = recover(&installation, &mut db).unwrap();
        assert!(summary.installed.is_empty());
        assert!(summary.removed.is_empty());
    }

    #[test]
    fn collision_aborts_before_critical_section() {
        let root = tempfile::tempdir().unwrap();
        let installation = Installation::open(root.path());
        let mut db = Database::open(&installation).unwrap();

        let first = Fixture::new("first", "1.0")
            .file("usr/bin/shared", b"a")
            .build(&installation);
        let second = Fixture::new("second", "1.0")
            .file("usr/bin/shared", b"b")
            .build(&installation);

        let result = apply(&installation, &mut db, vec![first, second], vec![]);
        assert!(matches!(result, Err(Error::Plan(plan::Error::Collisions(_)))));

        // Nothing journaled, nothing merged
        assert!(!Journal::exists(&installation));
        assert!(!root.path().join("usr/bin/shared").exists());
    }
}
