use chrono::{Duration, Utc};

use cloud_migration::models::resource::ResourceKind;
use cloud_migration::models::run::{resolve_run_status, RunStatus};
use cloud_migration::models::snapshot::{ListSnapshotsQuery, SnapshotState};
use cloud_migration::models::token::{token_hint, MigrationToken, TokenMaterial};

// ── Run status resolution ────────────────────────────────

#[test]
fn all_finished_snapshots_finish_the_run() {
    let states = [SnapshotState::Finished, SnapshotState::Finished];
    assert_eq!(resolve_run_status(&states), RunStatus::Finished);
}

#[test]
fn any_error_snapshot_fails_the_run() {
    let states = [
        SnapshotState::Finished,
        SnapshotState::Error,
        SnapshotState::Cancelled,
    ];
    assert_eq!(resolve_run_status(&states), RunStatus::Error);
}

#[test]
fn cancelled_snapshot_cancels_the_run() {
    let states = [SnapshotState::Finished, SnapshotState::Cancelled];
    assert_eq!(resolve_run_status(&states), RunStatus::Cancelled);
}

#[test]
fn run_without_snapshots_is_an_error() {
    assert_eq!(resolve_run_status(&[]), RunStatus::Error);
}

#[test]
fn unfinished_snapshot_is_an_error() {
    let states = [SnapshotState::Finished, SnapshotState::PendingUpload];
    assert_eq!(resolve_run_status(&states), RunStatus::Error);
}

// ── Lifecycle transitions ────────────────────────────────

#[test]
fn snapshot_follows_forward_path_only() {
    use SnapshotState::{Creating, Finished, Init, PendingUpload, Uploading};
    assert!(Init.can_transition_to(Creating));
    assert!(Creating.can_transition_to(PendingUpload));
    assert!(PendingUpload.can_transition_to(Uploading));
    assert!(Uploading.can_transition_to(Finished));

    assert!(!Init.can_transition_to(Uploading));
    assert!(!PendingUpload.can_transition_to(Finished));
    assert!(!Finished.can_transition_to(Init));
}

#[test]
fn terminal_snapshots_never_move() {
    for terminal in [
        SnapshotState::Finished,
        SnapshotState::Error,
        SnapshotState::Cancelled,
    ] {
        assert!(terminal.is_terminal());
        assert!(!terminal.can_transition_to(SnapshotState::Cancelled));
        assert!(!terminal.can_transition_to(SnapshotState::Error));
    }
}

#[test]
fn cancellable_states_are_the_non_terminal_ones() {
    let cancellable = SnapshotState::sources(SnapshotState::Cancelled);
    assert_eq!(
        cancellable,
        vec![
            SnapshotState::Init,
            SnapshotState::Creating,
            SnapshotState::PendingUpload,
            SnapshotState::Uploading,
        ]
    );
    assert!(cancellable.iter().all(|s| !s.is_terminal()));
}

#[test]
fn only_uploading_snapshots_can_finish() {
    assert_eq!(
        SnapshotState::sources(SnapshotState::Finished),
        vec![SnapshotState::Uploading]
    );
}

#[test]
fn run_sources_follow_the_lifecycle() {
    assert_eq!(RunStatus::sources(RunStatus::Running), vec![RunStatus::Pending]);
    assert_eq!(RunStatus::sources(RunStatus::Finished), vec![RunStatus::Running]);
    assert_eq!(
        RunStatus::sources(RunStatus::Cancelled),
        vec![RunStatus::Pending, RunStatus::Running]
    );
}

#[test]
fn run_transitions() {
    assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
    assert!(RunStatus::Pending.can_transition_to(RunStatus::Error));
    assert!(RunStatus::Running.can_transition_to(RunStatus::Finished));
    assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
    assert!(!RunStatus::Pending.can_transition_to(RunStatus::Finished));
    assert!(!RunStatus::Finished.can_transition_to(RunStatus::Error));
    assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Running));
}

// ── Tokens ───────────────────────────────────────────────

fn material(expires_in: Option<Duration>) -> TokenMaterial {
    TokenMaterial {
        secret: "glc_secret_value_a1b2".into(),
        remote_account_id: "stack-42".into(),
        expires_at: expires_in.map(|d| Utc::now() + d),
    }
}

#[test]
fn hint_keeps_last_four_characters() {
    assert_eq!(token_hint("glc_secret_value_a1b2"), "****a1b2");
}

#[test]
fn hint_of_short_secret_does_not_panic() {
    assert_eq!(token_hint("ab"), "****ab");
    assert_eq!(token_hint(""), "****");
}

#[test]
fn view_exposes_hint_not_secret() {
    let token = MigrationToken::new(7, material(None));
    let view = token.view();

    assert_eq!(view.uid, token.uid);
    assert_eq!(view.org_id, 7);
    assert_eq!(view.token_hint, "****a1b2");

    let json = serde_json::to_string(&view).expect("serialize view");
    assert!(!json.contains("glc_secret_value"));
}

#[test]
fn expiry_is_checked_against_now() {
    let now = Utc::now();
    let never = MigrationToken::new(1, material(None));
    let future = MigrationToken::new(1, material(Some(Duration::hours(1))));
    let past = MigrationToken::new(1, material(Some(Duration::hours(-1))));

    assert!(!never.is_expired_at(now));
    assert!(!future.is_expired_at(now));
    assert!(past.is_expired_at(now));
}

#[test]
fn material_round_trips_through_record() {
    let original = material(Some(Duration::minutes(5)));
    let token = MigrationToken::new(3, original.clone());
    assert_eq!(token.material(), original);
}

// ── Queries and resources ────────────────────────────────

#[test]
fn session_listing_defaults_to_unpaged() {
    let query = ListSnapshotsQuery::for_session(4, "s-1");
    assert_eq!(query.page, 1);
    assert_eq!(query.limit, 0);
    assert!(query.run_uid.is_none());
}

#[test]
fn resource_kind_directory_names() {
    assert_eq!(
        ResourceKind::from_dir_name("dashboards"),
        Some(ResourceKind::Dashboard)
    );
    assert_eq!(
        ResourceKind::from_dir_name("library_elements"),
        Some(ResourceKind::LibraryElement)
    );
    assert_eq!(
        ResourceKind::from_dir_name("contact_points"),
        Some(ResourceKind::ContactPoint)
    );
    assert_eq!(ResourceKind::from_dir_name("plugins"), None);
}

#[test]
fn debug_output_never_shows_the_secret() {
    let token = MigrationToken::new(7, material(None));

    let rendered = format!("{token:?} {:?}", token.material());
    assert!(!rendered.contains("glc_secret_value_a1b2"), "{rendered}");
    assert!(rendered.contains("[redacted]"));
    assert!(rendered.contains("stack-42"));
}
