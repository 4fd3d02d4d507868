//! Learner-data services the preload passes consult. All optional: a
//! missing collaborator just means its pass warms nothing.

use futures::future::BoxFuture;

use crate::models::{ErrorCombo, MasteryRecord};

/// Spaced-repetition scheduler.
pub trait Scheduler: Send + Sync {
    /// Keys due for review now.
    fn get_due_keys<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<String>>>;
}

pub trait ErrorAnalytics: Send + Sync {
    /// Categories the learner gets wrong, with a relative impact.
    fn get_error_prone_combos<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<ErrorCombo>>>;
}

pub trait MasteryStore: Send + Sync {
    fn get_mastery_records<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<MasteryRecord>>>;
}
