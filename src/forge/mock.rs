//! Scriptable in-process forge, used by the test suites and `serve --mock`.
//!
//! Behavior is driven by a shared state handle: tests populate destination
//! collisions, inject errors for the next calls, and script the poll results
//! each started migration reports. Counters make at-most-once assertions
//! cheap.

use super::url::parse_source_url;
use super::{
    rename_candidates, ArchiveHandle, DestForge, ForgeError, ForgeFactory, ForgeSet,
    MigrationPoll, MigrationStatus, ResolvedSource, ResolvedTarget, SourceForge,
};
use crate::migration::models::{CollisionPolicy, MigrationKind, Settings, Visibility};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct StartedMigration {
    pub external_id: String,
    pub kind: MigrationKind,
    pub target: String,
    pub archive_url: String,
}

#[derive(Default)]
struct MockState {
    existing_repos: HashSet<String>,
    source_visibility: HashMap<String, Visibility>,
    /// Poll results per external migration id; the last entry repeats.
    poll_scripts: HashMap<String, VecDeque<MigrationPoll>>,
    /// Script template assigned to the next started migration of each kind.
    dry_script: Option<Vec<MigrationPoll>>,
    live_script: Option<Vec<MigrationPoll>>,
    resolve_errors: VecDeque<ForgeError>,
    ensure_errors: VecDeque<ForgeError>,
    export_errors: VecDeque<ForgeError>,
    start_errors: VecDeque<ForgeError>,
    poll_errors: VecDeque<ForgeError>,
    auth_failing: bool,
    started: Vec<StartedMigration>,
    visibility_updates: Vec<(String, Visibility)>,
    renames: Vec<(String, String)>,
    cleanups: Vec<String>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct MockForge {
    state: Arc<Mutex<MockState>>,
}

impl MockForge {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- test configuration ----

    pub fn add_existing_repo(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .existing_repos
            .insert(name.to_string());
    }

    pub fn remove_existing_repo(&self, name: &str) {
        self.state.lock().unwrap().existing_repos.remove(name);
    }

    pub fn set_source_visibility(&self, canonical_id: &str, visibility: Visibility) {
        self.state
            .lock()
            .unwrap()
            .source_visibility
            .insert(canonical_id.to_string(), visibility);
    }

    /// Script the polls the next dry-run migrations will report.
    pub fn set_dry_run_script(&self, script: Vec<MigrationPoll>) {
        self.state.lock().unwrap().dry_script = Some(script);
    }

    /// Script the polls the next live migrations will report.
    pub fn set_live_script(&self, script: Vec<MigrationPoll>) {
        self.state.lock().unwrap().live_script = Some(script);
    }

    /// Script polls for an externally seeded migration id (crash recovery).
    pub fn script_polls_for(&self, external_id: &str, script: Vec<MigrationPoll>) {
        self.state
            .lock()
            .unwrap()
            .poll_scripts
            .insert(external_id.to_string(), script.into());
    }

    pub fn fail_next_resolve(&self, error: ForgeError) {
        self.state.lock().unwrap().resolve_errors.push_back(error);
    }

    pub fn fail_next_ensure(&self, error: ForgeError) {
        self.state.lock().unwrap().ensure_errors.push_back(error);
    }

    pub fn fail_next_export(&self, error: ForgeError) {
        self.state.lock().unwrap().export_errors.push_back(error);
    }

    pub fn fail_next_start(&self, error: ForgeError) {
        self.state.lock().unwrap().start_errors.push_back(error);
    }

    pub fn fail_next_poll(&self, error: ForgeError) {
        self.state.lock().unwrap().poll_errors.push_back(error);
    }

    /// When set, every destination call reports `AuthExpired` until cleared.
    pub fn set_auth_failing(&self, failing: bool) {
        self.state.lock().unwrap().auth_failing = failing;
    }

    // ---- inspection ----

    pub fn started_migrations(&self) -> Vec<StartedMigration> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn started_count(&self, kind: MigrationKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .started
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }

    pub fn visibility_updates(&self) -> Vec<(String, Visibility)> {
        self.state.lock().unwrap().visibility_updates.clone()
    }

    pub fn renames(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().renames.clone()
    }

    pub fn cleanups(&self) -> Vec<String> {
        self.state.lock().unwrap().cleanups.clone()
    }

    pub fn repo_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().existing_repos.contains(name)
    }

    fn check_auth(state: &MockState) -> Result<(), ForgeError> {
        if state.auth_failing {
            Err(ForgeError::AuthExpired)
        } else {
            Ok(())
        }
    }

    fn default_script(kind: MigrationKind) -> Vec<MigrationPoll> {
        match kind {
            MigrationKind::DryRun => vec![MigrationPoll::succeeded()],
            MigrationKind::Live => vec![
                MigrationPoll::running(super::MigrationPhase::Queued),
                MigrationPoll::running(super::MigrationPhase::Migrating),
                MigrationPoll::succeeded(),
            ],
        }
    }
}

#[async_trait]
impl SourceForge for MockForge {
    async fn resolve_repo(&self, raw: &str) -> Result<ResolvedSource, ForgeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.resolve_errors.pop_front() {
            return Err(error);
        }
        let parsed = parse_source_url(raw)?;
        let canonical_id = parsed.canonical_id();
        let visibility = state
            .source_visibility
            .get(&canonical_id)
            .copied()
            .unwrap_or(Visibility::Private);
        Ok(ResolvedSource {
            canonical_id,
            canonical_url: parsed.canonical_url(),
            visibility,
            size_bytes: 1024,
        })
    }

    async fn export_archive(&self, source: &ResolvedSource) -> Result<ArchiveHandle, ForgeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.export_errors.pop_front() {
            return Err(error);
        }
        state.next_id += 1;
        Ok(ArchiveHandle {
            url: format!("mock://archive/{}/{}", source.canonical_id, state.next_id),
        })
    }
}

#[async_trait]
impl DestForge for MockForge {
    async fn ensure_repo(
        &self,
        name: &str,
        _visibility: Visibility,
        on_collision: CollisionPolicy,
    ) -> Result<ResolvedTarget, ForgeError> {
        let mut state = self.state.lock().unwrap();
        Self::check_auth(&state)?;
        if let Some(error) = state.ensure_errors.pop_front() {
            return Err(error);
        }
        if !state.existing_repos.contains(name) {
            state.existing_repos.insert(name.to_string());
            return Ok(ResolvedTarget {
                name: name.to_string(),
                renamed: false,
            });
        }
        match on_collision {
            CollisionPolicy::Skip => Ok(ResolvedTarget {
                name: name.to_string(),
                renamed: false,
            }),
            CollisionPolicy::Fail => Err(ForgeError::Conflict {
                name: name.to_string(),
            }),
            CollisionPolicy::Rename => {
                for candidate in rename_candidates(name).take(50) {
                    if !state.existing_repos.contains(&candidate) {
                        state.existing_repos.insert(candidate.clone());
                        return Ok(ResolvedTarget {
                            name: candidate,
                            renamed: true,
                        });
                    }
                }
                Err(ForgeError::permanent(format!(
                    "no free destination name for {name}"
                )))
            }
        }
    }

    async fn start_migration(
        &self,
        kind: MigrationKind,
        archive: &ArchiveHandle,
        target: &ResolvedTarget,
    ) -> Result<String, ForgeError> {
        let mut state = self.state.lock().unwrap();
        Self::check_auth(&state)?;
        if let Some(error) = state.start_errors.pop_front() {
            return Err(error);
        }
        state.next_id += 1;
        let external_id = format!("mig-{}", state.next_id);
        let script = match kind {
            MigrationKind::DryRun => state.dry_script.clone(),
            MigrationKind::Live => state.live_script.clone(),
        }
        .unwrap_or_else(|| Self::default_script(kind));
        state
            .poll_scripts
            .insert(external_id.clone(), script.into());
        state.started.push(StartedMigration {
            external_id: external_id.clone(),
            kind,
            target: target.name.clone(),
            archive_url: archive.url.clone(),
        });
        Ok(external_id)
    }

    async fn poll_migration(&self, external_id: &str) -> Result<MigrationPoll, ForgeError> {
        let mut state = self.state.lock().unwrap();
        Self::check_auth(&state)?;
        if let Some(error) = state.poll_errors.pop_front() {
            return Err(error);
        }
        match state.poll_scripts.get_mut(external_id) {
            Some(script) => {
                if script.len() > 1 {
                    Ok(script.pop_front().unwrap())
                } else {
                    script
                        .front()
                        .cloned()
                        .ok_or_else(|| ForgeError::permanent("empty poll script"))
                }
            }
            None => Err(ForgeError::permanent(format!(
                "unknown migration {external_id}"
            ))),
        }
    }

    async fn cleanup(&self, external_id: &str) -> Result<(), ForgeError> {
        self.state
            .lock()
            .unwrap()
            .cleanups
            .push(external_id.to_string());
        Ok(())
    }

    async fn set_visibility(&self, name: &str, visibility: Visibility) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        Self::check_auth(&state)?;
        state
            .visibility_updates
            .push((name.to_string(), visibility));
        Ok(())
    }

    async fn rename_repo(&self, name: &str, new_name: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        Self::check_auth(&state)?;
        if state.existing_repos.contains(new_name) {
            return Err(ForgeError::Conflict {
                name: new_name.to_string(),
            });
        }
        state.existing_repos.remove(name);
        state.existing_repos.insert(new_name.to_string());
        state.renames.push((name.to_string(), new_name.to_string()));
        Ok(())
    }
}

/// Factory returning the same mock pair on every build; counts rebuilds so
/// tests can assert credential rotation recreates clients.
pub struct MockForgeFactory {
    forge: MockForge,
    builds: AtomicUsize,
}

impl MockForgeFactory {
    pub fn new(forge: MockForge) -> Self {
        Self {
            forge,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl ForgeFactory for MockForgeFactory {
    fn build(&self, _settings: &Settings) -> Result<ForgeSet, ForgeError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(ForgeSet {
            source: Arc::new(self.forge.clone()),
            dest: Arc::new(self.forge.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collision_policies() {
        let forge = MockForge::new();
        forge.add_existing_repo("web");

        let skipped = forge
            .ensure_repo("web", Visibility::Private, CollisionPolicy::Skip)
            .await
            .unwrap();
        assert_eq!(skipped.name, "web");
        assert!(!skipped.renamed);

        let conflict = forge
            .ensure_repo("web", Visibility::Private, CollisionPolicy::Fail)
            .await;
        assert!(matches!(conflict, Err(ForgeError::Conflict { .. })));

        let renamed = forge
            .ensure_repo("web", Visibility::Private, CollisionPolicy::Rename)
            .await
            .unwrap();
        assert_eq!(renamed.name, "web-1");
        assert!(renamed.renamed);

        // The suffixed name is now taken too.
        let renamed = forge
            .ensure_repo("web", Visibility::Private, CollisionPolicy::Rename)
            .await
            .unwrap();
        assert_eq!(renamed.name, "web-2");
    }

    #[tokio::test]
    async fn test_poll_script_repeats_last_entry() {
        let forge = MockForge::new();
        forge.script_polls_for("mig-x", vec![MigrationPoll::succeeded()]);
        for _ in 0..3 {
            let poll = forge.poll_migration("mig-x").await.unwrap();
            assert_eq!(poll.status, MigrationStatus::Succeeded);
        }
    }

    #[tokio::test]
    async fn test_auth_failing_gates_destination_calls() {
        let forge = MockForge::new();
        forge.set_auth_failing(true);
        let result = forge
            .ensure_repo("web", Visibility::Private, CollisionPolicy::Skip)
            .await;
        assert!(matches!(result, Err(ForgeError::AuthExpired)));

        forge.set_auth_failing(false);
        assert!(forge
            .ensure_repo("web", Visibility::Private, CollisionPolicy::Skip)
            .await
            .is_ok());
    }
}
