//! In-memory hosting client for tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::core::BkstgError;
use crate::hosting::{CreateReviewRequest, HostingClient, ReviewRequest};

#[derive(Debug, Default)]
struct HostState {
    open: Vec<(String, ReviewRequest)>,
    created: Vec<CreateReviewRequest>,
    failures: VecDeque<BkstgError>,
    next_number: u64,
}

/// [`HostingClient`] that records requests instead of calling a service.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    /// Creates a host with no open review requests.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut HostState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut state)
    }

    /// Requests received so far.
    #[must_use]
    pub fn created(&self) -> Vec<CreateReviewRequest> {
        self.with_state(|state| state.created.clone())
    }

    /// Registers an open review request not created through this client.
    pub fn add_open(&self, repository: &str, head: &str) {
        self.with_state(|state| {
            state.next_number += 1;
            let number = state.next_number;
            state.open.push((
                repository.to_string(),
                ReviewRequest {
                    number: Some(number),
                    url: format!("https://github.com/{repository}/pull/{number}"),
                    title: head.to_string(),
                    head: head.to_string(),
                    base: "main".to_string(),
                },
            ));
        });
    }

    /// Makes the next call fail with `error`.
    pub fn fail_next(&self, error: BkstgError) {
        self.with_state(|state| state.failures.push_back(error));
    }

    fn take_failure(&self) -> Result<()> {
        match self.with_state(|state| state.failures.pop_front()) {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HostingClient for FakeHost {
    async fn create_review_request(&self, request: CreateReviewRequest) -> Result<ReviewRequest> {
        self.take_failure()?;
        Ok(self.with_state(|state| {
            state.next_number += 1;
            let number = state.next_number;
            let review = ReviewRequest {
                number: Some(number),
                url: format!("https://github.com/{}/pull/{number}", request.repository),
                title: request.title.clone(),
                head: request.head.clone(),
                base: request.base.clone(),
            };
            state.open.push((request.repository.clone(), review.clone()));
            state.created.push(request);
            review
        }))
    }

    async fn list_open_review_requests(
        &self,
        repository: &str,
        head_prefix: &str,
    ) -> Result<Vec<ReviewRequest>> {
        self.take_failure()?;
        Ok(self.with_state(|state| {
            state
                .open
                .iter()
                .filter(|(repo, pr)| repo == repository && pr.head.starts_with(head_prefix))
                .map(|(_, pr)| pr.clone())
                .collect()
        }))
    }

    async fn check_auth(&self) -> Result<()> {
        self.take_failure()
    }
}
