//! Submitting check-ins and checkouts, and acting on the server's answer.

use crate::api::{AttendanceApi, CheckInStatus, CheckOutStatus, EmployeeId};
use crate::greeter::{render, Speaker};
use crate::session::{lock, Action, Presence, SharedSession};
use std::sync::Arc;
use std::time::Instant;

/// Sends attendance requests and settles the session with the outcome.
///
/// A request that errors, or a check-in the server does not accept, leaves
/// the label `Failed` for the rest of the session.
pub struct Attendance {
    api: Arc<dyn AttendanceApi>,
    speaker: Arc<dyn Speaker>,
    session: SharedSession,
    greeting: String,
    farewell: String,
}

impl Attendance {
    pub fn new(
        api: Arc<dyn AttendanceApi>,
        speaker: Arc<dyn Speaker>,
        session: SharedSession,
        greeting: String,
        farewell: String,
    ) -> Self {
        Self { api, speaker, session, greeting, farewell }
    }

    /// Carry out an action the session has already claimed for `label`.
    pub async fn submit(&self, action: Action, label: &str, user_id: &EmployeeId, snapshot: &[u8]) {
        match action {
            Action::CheckIn => self.check_in(label, user_id, snapshot).await,
            Action::CheckOut => self.check_out(label, user_id, snapshot).await,
        }
    }

    async fn check_in(&self, label: &str, user_id: &EmployeeId, snapshot: &[u8]) {
        let response = match self.api.check_in(user_id, snapshot).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(label, %user_id, error = %e, "check-in request failed");
                self.settle(label, Presence::Failed);
                return;
            }
        };

        match response.check_in_status() {
            CheckInStatus::CheckedIn => {
                tracing::info!(label, %user_id, time = ?response.local_time(), "checked in");
                self.settle(label, Presence::CheckedIn);
                self.say(&self.greeting, label).await;
            }
            CheckInStatus::AlreadyCheckedIn => {
                tracing::info!(label, %user_id, "already checked in, checking out");
                self.settle(label, Presence::CheckingOut);
                self.check_out(label, user_id, snapshot).await;
            }
            CheckInStatus::Other(status) => {
                tracing::warn!(label, %user_id, %status, "check-in not accepted");
                self.settle(label, Presence::Failed);
            }
        }
    }

    async fn check_out(&self, label: &str, user_id: &EmployeeId, snapshot: &[u8]) {
        let response = match self.api.check_out(user_id, snapshot).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(label, %user_id, error = %e, "checkout request failed");
                self.settle(label, Presence::Failed);
                return;
            }
        };

        match response.check_out_status() {
            CheckOutStatus::CheckedOut => {
                tracing::info!(label, %user_id, time = ?response.local_time(), "checked out");
                self.settle(label, Presence::CheckedOut);
                self.say(&self.farewell, label).await;
            }
            CheckOutStatus::Other(status) => {
                tracing::info!(label, %user_id, %status, "checkout not recorded, treating as checked out");
                self.settle(label, Presence::CheckedOut);
            }
        }
    }

    fn settle(&self, label: &str, presence: Presence) {
        lock(&self.session).settle(label, presence, Instant::now());
    }

    async fn say(&self, template: &str, label: &str) {
        if let Err(e) = self.speaker.speak(&render(template, label)).await {
            tracing::warn!(label, error = %e, "greeting failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::{ApiError, AttendanceResponse, EmployeeLabel};
    use crate::greeter::SpeechError;
    use crate::session::Session;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replies to attendance posts from two scripted queues and records each call.
    #[derive(Default)]
    pub(crate) struct ScriptedApi {
        pub check_ins: Mutex<VecDeque<Result<AttendanceResponse, ApiError>>>,
        pub check_outs: Mutex<VecDeque<Result<AttendanceResponse, ApiError>>>,
        pub calls: Mutex<Vec<(String, String, usize)>>,
    }

    impl ScriptedApi {
        pub fn reply_in(self, status: &str) -> Self {
            self.check_ins.lock().unwrap().push_back(Ok(response(status)));
            self
        }

        pub fn reply_out(self, status: &str) -> Self {
            self.check_outs.lock().unwrap().push_back(Ok(response(status)));
            self
        }

        pub fn fail_in(self) -> Self {
            self.check_ins
                .lock()
                .unwrap()
                .push_back(Err(ApiError::Status { url: "/api/face/attendance".into(), status: 502 }));
            self
        }

        pub fn calls(&self) -> Vec<(String, String, usize)> {
            self.calls.lock().unwrap().clone()
        }
    }

    pub(crate) fn response(status: &str) -> AttendanceResponse {
        AttendanceResponse { status: status.into(), time: Some("2024-05-01T08:00:00Z".into()) }
    }

    #[async_trait]
    impl AttendanceApi for ScriptedApi {
        async fn fetch_labels(&self) -> Result<Vec<EmployeeLabel>, ApiError> {
            Ok(Vec::new())
        }

        async fn fetch_avatar(&self, avatar: &str) -> Result<Vec<u8>, ApiError> {
            Err(ApiError::Status { url: avatar.into(), status: 404 })
        }

        async fn check_in(&self, user_id: &EmployeeId, snapshot: &[u8]) -> Result<AttendanceResponse, ApiError> {
            self.calls.lock().unwrap().push(("in".into(), user_id.to_string(), snapshot.len()));
            self.check_ins.lock().unwrap().pop_front().unwrap_or_else(|| Ok(response("checked-in")))
        }

        async fn check_out(&self, user_id: &EmployeeId, snapshot: &[u8]) -> Result<AttendanceResponse, ApiError> {
            self.calls.lock().unwrap().push(("out".into(), user_id.to_string(), snapshot.len()));
            self.check_outs.lock().unwrap().pop_front().unwrap_or_else(|| Ok(response("checked-out")))
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSpeaker {
        pub lines: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Speaker for RecordingSpeaker {
        async fn speak(&self, text: &str) -> Result<(), SpeechError> {
            self.lines.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    pub(crate) fn attendance(
        api: Arc<ScriptedApi>,
        speaker: Arc<RecordingSpeaker>,
        session: SharedSession,
    ) -> Attendance {
        Attendance::new(
            api,
            speaker,
            session,
            "Xin chào {name}".into(),
            "Xin chào {name}. Chúc bạn buổi tối vui vẻ!".into(),
        )
    }

    struct Harness {
        api: Arc<ScriptedApi>,
        speaker: Arc<RecordingSpeaker>,
        session: SharedSession,
        attendance: Attendance,
    }

    fn harness(api: ScriptedApi) -> Harness {
        let api = Arc::new(api);
        let speaker = Arc::new(RecordingSpeaker::default());
        let session = Session::shared(Duration::ZERO);
        let attendance = attendance(api.clone(), speaker.clone(), session.clone());
        Harness { api, speaker, session, attendance }
    }

    impl Harness {
        async fn recognize(&self, label: &str, id: i64) {
            let claimed = lock(&self.session).claim(label, Instant::now());
            if let Some(action) = claimed {
                self.attendance.submit(action, label, &EmployeeId::Number(id), b"jpeg").await;
            }
        }

        fn presence(&self, label: &str) -> Option<Presence> {
            lock(&self.session).presence(label)
        }

        fn lines(&self) -> Vec<String> {
            self.speaker.lines.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_accepted_check_in_greets() {
        let h = harness(ScriptedApi::default().reply_in("checked-in"));
        h.recognize("An", 7).await;

        assert_eq!(h.presence("An"), Some(Presence::CheckedIn));
        assert_eq!(h.lines(), vec!["Xin chào An"]);
        assert_eq!(h.api.calls(), vec![("in".to_string(), "7".to_string(), 4)]);
    }

    #[tokio::test]
    async fn test_second_recognition_checks_out_with_farewell() {
        let h = harness(ScriptedApi::default().reply_in("checked-in").reply_out("checked-out"));
        h.recognize("An", 7).await;
        h.recognize("An", 7).await;

        assert_eq!(h.presence("An"), Some(Presence::CheckedOut));
        assert_eq!(
            h.lines(),
            vec!["Xin chào An", "Xin chào An. Chúc bạn buổi tối vui vẻ!"]
        );
        // Checked out: further sightings send nothing.
        h.recognize("An", 7).await;
        assert_eq!(h.api.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_already_checked_in_triggers_checkout() {
        let h = harness(ScriptedApi::default().reply_in("already checked-in").reply_out("checked-out"));
        h.recognize("Binh", 2).await;

        let kinds: Vec<String> = h.api.calls().into_iter().map(|c| c.0).collect();
        assert_eq!(kinds, vec!["in", "out"]);
        assert_eq!(h.presence("Binh"), Some(Presence::CheckedOut));
        assert_eq!(h.lines(), vec!["Xin chào Binh. Chúc bạn buổi tối vui vẻ!"]);
    }

    #[tokio::test]
    async fn test_unrecorded_checkout_is_silent() {
        let h = harness(
            ScriptedApi::default()
                .reply_in("already checked-in")
                .reply_out("already checked-out"),
        );
        h.recognize("Chi", 3).await;

        assert_eq!(h.presence("Chi"), Some(Presence::CheckedOut));
        assert!(h.lines().is_empty());
    }

    #[tokio::test]
    async fn test_failed_check_in_is_not_retried() {
        let h = harness(ScriptedApi::default().fail_in());
        h.recognize("Dung", 4).await;
        assert_eq!(h.presence("Dung"), Some(Presence::Failed));

        h.recognize("Dung", 4).await;
        h.recognize("Dung", 4).await;
        assert_eq!(h.api.calls().len(), 1);
        assert!(h.lines().is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_check_in_status_fails_label() {
        let h = harness(ScriptedApi::default().reply_in("employee disabled"));
        h.recognize("Em", 5).await;
        assert_eq!(h.presence("Em"), Some(Presence::Failed));
        assert!(h.lines().is_empty());
    }
}
