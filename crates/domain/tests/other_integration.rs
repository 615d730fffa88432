//! Integration tests for others and the shared save/delete protocol.

mod support;

use domain::{ChangeKind, ChangedEvent, DomainError, Error, MutableOtherDetails};
use futures_util::TryStreamExt;
use row_store::Version;
use support::{Harness, nid, summary};

mod save {
    use super::*;

    #[tokio::test]
    async fn first_save_creates_version_one_and_one_event() {
        let mut h = Harness::new();
        let other = h.persistence.others.create_new(nid("o"));
        assert_eq!(other.version().unwrap(), Version::initial());
        assert!(other.changed().unwrap());

        let result = other.save().await.unwrap();

        assert!(result.changed);
        assert_eq!(other.version().unwrap(), Version::first());
        assert!(!other.changed().unwrap());

        let events = h.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ChangedEvent::OtherChanged(change) => {
                assert_eq!(change.before, None);
                let after = change.after.as_ref().unwrap();
                assert_eq!(after.natural_id, nid("o"));
                assert_eq!(after.version, Version::first());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn resaving_unchanged_object_writes_nothing() {
        let mut h = Harness::new();
        let other = h.persistence.others.create_new(nid("o"));
        other.save().await.unwrap();
        h.drain();
        let writes = h.writes().await;

        let result = other.save().await.unwrap();

        assert!(!result.changed);
        assert_eq!(h.writes().await, writes);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn update_then_save_bumps_version_and_reports_both_images() {
        let mut h = Harness::new();
        let other = h.persistence.others.create_new(nid("o"));
        other.save().await.unwrap();
        h.drain();

        other
            .update(|o| {
                o.set_value(Some("blue".into()));
                Ok(())
            })
            .unwrap();
        assert!(other.changed().unwrap());
        other.save().await.unwrap();

        assert_eq!(other.version().unwrap(), Version::new(2));
        assert_eq!(other.value().unwrap().as_deref(), Some("blue"));
        let events = h.drain();
        assert_eq!(summary(&events), vec![("OtherChanged", ChangeKind::Updated, "o".into())]);
        let ChangedEvent::OtherChanged(change) = &events[0] else {
            panic!("expected an other event");
        };
        assert_eq!(change.before.as_ref().unwrap().value, None);
        assert_eq!(change.after.as_ref().unwrap().value.as_deref(), Some("blue"));
    }

    #[tokio::test]
    async fn reverting_an_edit_before_saving_is_not_a_change() {
        let h = Harness::new();
        let other = h.persistence.others.create_new(nid("o"));
        other.save().await.unwrap();

        other
            .update(|o| {
                o.set_value(Some("tmp".into()));
                o.set_value(None);
                Ok(())
            })
            .unwrap();

        assert!(!other.changed().unwrap());
    }

    #[tokio::test]
    async fn stale_handle_save_is_a_conflict() {
        let h = Harness::new();
        h.persistence.others.create_new(nid("o")).save().await.unwrap();
        let first = h.persistence.others.find_existing(&nid("o")).await.unwrap().unwrap();
        let second = h.persistence.others.find_existing(&nid("o")).await.unwrap().unwrap();

        first
            .update(|o| {
                o.set_value(Some("first".into()));
                Ok(())
            })
            .unwrap();
        first.save().await.unwrap();

        second
            .update(|o| {
                o.set_value(Some("second".into()));
                Ok(())
            })
            .unwrap();
        let err = second.save().await.unwrap_err();

        assert!(err.is_conflict(), "unexpected error {err}");
        // failed save leaves the handle as it was
        assert_eq!(second.version().unwrap(), Version::first());
        assert!(second.changed().unwrap());
    }
}

mod delete {
    use super::*;

    #[tokio::test]
    async fn delete_publishes_and_makes_handle_inert() {
        let mut h = Harness::new();
        let other = h.persistence.others.create_new(nid("o"));
        other.save().await.unwrap();
        h.drain();

        other.delete().await.unwrap();

        assert!(other.is_deleted());
        assert_eq!(
            summary(&h.drain()),
            vec![("OtherChanged", ChangeKind::Deleted, "o".into())]
        );
        assert!(h.persistence.others.find_existing(&nid("o")).await.unwrap().is_none());

        let err = other.value().unwrap_err();
        assert_eq!(
            err.domain(),
            Some(&DomainError::Deleted {
                entity: "other",
                natural_id: nid("o"),
            })
        );
        assert!(matches!(other.save().await, Err(Error::Domain(_))));
        assert!(matches!(other.delete().await, Err(Error::Domain(_))));
    }

    #[tokio::test]
    async fn deleting_an_unsaved_object_writes_nothing() {
        let mut h = Harness::new();
        let other = h.persistence.others.create_new(nid("o"));

        other.delete().await.unwrap();

        assert!(other.is_deleted());
        assert_eq!(h.writes().await, 0);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn stale_delete_is_a_conflict() {
        let h = Harness::new();
        h.persistence.others.create_new(nid("o")).save().await.unwrap();
        let stale = h.persistence.others.find_existing(&nid("o")).await.unwrap().unwrap();
        let fresh = h.persistence.others.find_existing(&nid("o")).await.unwrap().unwrap();
        fresh
            .update(|o| {
                o.set_value(Some("x".into()));
                Ok(())
            })
            .unwrap();
        fresh.save().await.unwrap();

        let err = stale.delete().await.unwrap_err();

        assert!(err.is_conflict());
        assert!(!stale.is_deleted());
    }
}

mod factory {
    use super::*;

    #[tokio::test]
    async fn find_existing_or_create_new_prefers_the_stored_row() {
        let h = Harness::new();
        let saved = h.persistence.others.create_new(nid("o"));
        saved.save().await.unwrap();

        let found = h
            .persistence
            .others
            .find_existing_or_create_new(nid("o"))
            .await
            .unwrap();
        let created = h
            .persistence
            .others
            .find_existing_or_create_new(nid("new"))
            .await
            .unwrap();

        assert_eq!(found.version().unwrap(), Version::first());
        assert_eq!(found, saved);
        assert_eq!(created.version().unwrap(), Version::initial());
    }

    #[tokio::test]
    async fn all_streams_every_other_in_natural_id_order() {
        let h = Harness::new();
        for id in ["b", "c", "a"] {
            h.persistence.others.create_new(nid(id)).save().await.unwrap();
        }

        let others: Vec<_> = h.persistence.others.all().await.unwrap().try_collect().await.unwrap();

        let ids: Vec<&str> = others.iter().map(|o| o.natural_id().as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn handles_with_different_versions_are_not_equal() {
        let h = Harness::new();
        h.persistence.others.create_new(nid("o")).save().await.unwrap();
        let stale = h.persistence.others.find_existing(&nid("o")).await.unwrap().unwrap();
        let fresh = h.persistence.others.find_existing(&nid("o")).await.unwrap().unwrap();
        assert_eq!(stale, fresh);

        fresh
            .update(|o| {
                o.set_value(Some("x".into()));
                Ok(())
            })
            .unwrap();
        fresh.save().await.unwrap();

        assert_ne!(stale, fresh);
    }
}
