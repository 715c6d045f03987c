// src/poll.rs
//! The classroom session: roster, the single active poll, and its tally.
//!
//! `Session` is a plain state machine. It is only ever driven from the coordinator
//! task, one command at a time, so none of its methods need locking.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::PollError;
use crate::events::{
    ClientEvent, CreatePollRequest, JoinRequest, Outbound, PollState, RemoveStudentRequest,
    SendMessageRequest, ServerEvent, SubmitAnswerRequest,
};
use crate::models::{
    ActivePollView, ChatMessage, ConnectionId, Participant, Poll, PollRecord, Role, Tally,
};
use crate::store::StoreSink;

/// Arranges for `ClosePoll { poll_id }` to be delivered back to the session later.
pub trait Scheduler: Send + Sync {
    fn schedule_close(&self, poll_id: Uuid, after: Duration);
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub default_time_limit: u64,
    pub all_answered_grace: Duration,
    pub history_limit: usize,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_time_limit: config.default_time_limit,
            all_answered_grace: config.all_answered_grace,
            history_limit: config.history_limit,
        }
    }
}

pub struct Session {
    settings: SessionSettings,
    connections: BTreeMap<ConnectionId, mpsc::UnboundedSender<Outbound>>,
    roster: BTreeMap<ConnectionId, Participant>,
    active_poll: Option<Poll>,
    /// Results of the active poll, or of the last closed one until the next poll starts.
    tally: Tally,
    history: VecDeque<PollRecord>,
    store: StoreSink,
    scheduler: Arc<dyn Scheduler>,
}

impl Session {
    pub fn new(settings: SessionSettings, store: StoreSink, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            settings,
            connections: BTreeMap::new(),
            roster: BTreeMap::new(),
            active_poll: None,
            tally: Tally::default(),
            history: VecDeque::new(),
            store,
            scheduler,
        }
    }

    pub fn connect(&mut self, id: ConnectionId, outbound: mpsc::UnboundedSender<Outbound>) {
        debug!("Connection {id} opened");
        self.connections.insert(id, outbound);
    }

    pub fn disconnect(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
        if let Some(participant) = self.roster.remove(&id) {
            info!(
                "{} {} disconnected",
                participant.role.as_str(),
                participant.name
            );
            self.broadcast_roster();
        }
    }

    /// Applies one inbound action. Rejections go back to the caller as an `error` event.
    pub fn handle(&mut self, id: ConnectionId, event: ClientEvent) {
        let name = event.name();
        // Removed connections may still have frames in flight before their close lands.
        if !self.connections.contains_key(&id) {
            debug!("Ignoring {name} from closed connection {id}");
            return;
        }
        let result = match event {
            ClientEvent::Join(request) => {
                self.join(id, request);
                Ok(())
            }
            ClientEvent::CreatePoll(request) => self.create_poll(id, request),
            ClientEvent::SubmitAnswer(request) => self.submit_answer(id, request),
            ClientEvent::EndPoll => self.end_poll(id),
            ClientEvent::SendMessage(request) => self.send_message(id, request),
            ClientEvent::RemoveStudent(request) => self.remove_student(id, request),
        };

        if let Err(err) = result {
            warn!("Rejected {name} from connection {id}: {err}");
            self.send_error(id, &err);
        }
    }

    pub fn join(&mut self, id: ConnectionId, request: JoinRequest) {
        let mut participant = Participant::new(request.name, request.role);
        // Re-joining on the same connection must not reset a vote already cast.
        if self.active_poll.is_some() {
            if let Some(previous) = self.roster.get(&id) {
                participant.answered = previous.answered;
            }
        }
        info!("{} {} joined", participant.role.as_str(), participant.name);
        let has_answered = participant.answered;
        self.roster.insert(id, participant);

        self.send(
            id,
            ServerEvent::PollState(PollState {
                active_poll: self.active_poll.clone(),
                tally: self.tally.clone(),
                roster: self.roster_list(),
                has_answered,
            }),
        );
        self.broadcast_roster();
    }

    pub fn create_poll(
        &mut self,
        id: ConnectionId,
        request: CreatePollRequest,
    ) -> Result<(), PollError> {
        let creator = match self.roster.get(&id) {
            Some(user) if user.role == Role::Teacher => user.name.clone(),
            _ => return Err(PollError::TEACHER_ONLY_CREATE),
        };

        let (answered, students) = self.participation();
        if self.active_poll.is_some() && students > 0 && answered < students {
            return Err(PollError::POLL_IN_PROGRESS);
        }

        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(PollError::Validation("A poll needs a question".into()));
        }
        let options: Vec<String> = request
            .options
            .iter()
            .map(|option| option.trim().to_string())
            .collect();
        if options.is_empty() || options.iter().any(String::is_empty) {
            return Err(PollError::Validation(
                "A poll needs at least one non-empty option".into(),
            ));
        }
        if options
            .iter()
            .enumerate()
            .any(|(i, option)| options[..i].contains(option))
        {
            return Err(PollError::Validation("Poll options must be distinct".into()));
        }

        // The previous poll is complete; close it properly before replacing it.
        self.close_poll();

        let time_limit = request
            .time_limit
            .unwrap_or(self.settings.default_time_limit);
        let poll = Poll::new(question, options, time_limit, creator);

        if let Some(reply_to) = self.connections.get(&id) {
            self.store.create_poll(poll.clone(), reply_to.clone());
        }

        self.tally = Tally::for_options(&poll.options);
        for participant in self.roster.values_mut() {
            participant.answered = false;
        }

        info!("New poll created: {} ({})", poll.question, poll.id);
        self.broadcast(ServerEvent::NewPoll {
            poll: poll.clone(),
            tally: self.tally.clone(),
        });

        if poll.time_limit > 0 {
            self.scheduler
                .schedule_close(poll.id, Duration::from_secs(poll.time_limit));
        }
        self.active_poll = Some(poll);

        Ok(())
    }

    pub fn submit_answer(
        &mut self,
        id: ConnectionId,
        request: SubmitAnswerRequest,
    ) -> Result<(), PollError> {
        let participant = match self.roster.get(&id) {
            Some(user) if user.is_student() => user,
            _ => return Err(PollError::STUDENT_ONLY_ANSWER),
        };
        let poll_id = match &self.active_poll {
            Some(poll) => poll.id,
            None => return Err(PollError::NO_ACTIVE_POLL),
        };
        if participant.answered {
            return Err(PollError::ALREADY_ANSWERED);
        }
        if !self.tally.contains(&request.selected_option) {
            return Err(PollError::Validation("Invalid option selected".into()));
        }

        let name = participant.name.clone();
        let role = participant.role;
        self.tally.record(&request.selected_option);
        if let Some(participant) = self.roster.get_mut(&id) {
            participant.answered = true;
        }
        info!("{name} answered: {}", request.selected_option);

        if let Some(reply_to) = self.connections.get(&id) {
            self.store.record_answer(
                poll_id,
                name,
                role,
                request.selected_option,
                reply_to.clone(),
            );
        }

        let (answered, students) = self.participation();
        self.broadcast(ServerEvent::PollResultsUpdated {
            tally: self.tally.clone(),
            answered_count: answered,
            total_students: students,
        });

        if students > 0 && answered == students {
            debug!("All {students} students answered poll {poll_id}");
            self.scheduler
                .schedule_close(poll_id, self.settings.all_answered_grace);
        }

        Ok(())
    }

    pub fn end_poll(&mut self, id: ConnectionId) -> Result<(), PollError> {
        match self.roster.get(&id) {
            Some(user) if user.role == Role::Teacher => {
                self.close_poll();
                Ok(())
            }
            _ => Err(PollError::TEACHER_ONLY_END),
        }
    }

    /// Timer entry point. Ignored unless `poll_id` is still the active poll.
    pub fn close_poll_if_current(&mut self, poll_id: Uuid) {
        match &self.active_poll {
            Some(poll) if poll.id == poll_id => self.close_poll(),
            _ => debug!("Ignoring stale close for poll {poll_id}"),
        }
    }

    pub fn close_poll(&mut self) {
        let Some(mut poll) = self.active_poll.take() else {
            return;
        };
        poll.is_active = false;

        let (answered, students) = self.participation();
        let record = PollRecord {
            poll: poll.clone(),
            results: self.tally.clone(),
            ended_at: Some(Utc::now()),
            total_answers: answered,
            total_students: students,
        };

        self.history.push_front(record.clone());
        self.history.truncate(self.settings.history_limit);
        self.store.close_poll(record);

        info!(
            "Poll ended: {} ({} votes, {answered}/{students} answered)",
            poll.question,
            self.tally.total()
        );
        self.broadcast(ServerEvent::PollEnded {
            poll,
            tally: self.tally.clone(),
        });
    }

    pub fn send_message(
        &mut self,
        id: ConnectionId,
        request: SendMessageRequest,
    ) -> Result<(), PollError> {
        let sender = self.roster.get(&id).ok_or(PollError::NOT_JOINED)?;
        let message = ChatMessage {
            id: Uuid::new_v4(),
            sender: sender.name.clone(),
            role: sender.role,
            text: request.message,
            timestamp: Utc::now(),
        };
        debug!("Chat from {}: {}", message.sender, message.text);
        self.broadcast(ServerEvent::NewMessage(message));
        Ok(())
    }

    pub fn remove_student(
        &mut self,
        id: ConnectionId,
        request: RemoveStudentRequest,
    ) -> Result<(), PollError> {
        match self.roster.get(&id) {
            Some(user) if user.role == Role::Teacher => {}
            _ => return Err(PollError::TEACHER_ONLY_REMOVE),
        }

        let target = self
            .roster
            .iter()
            .find(|(_, user)| user.is_student() && user.name == request.student_name)
            .map(|(target, _)| *target)
            .ok_or_else(|| {
                PollError::Validation(format!("Student {} not found", request.student_name))
            })?;

        self.roster.remove(&target);
        if let Some(outbound) = self.connections.remove(&target) {
            let _ = outbound.send(Outbound::Event(ServerEvent::RemovedByTeacher));
            let _ = outbound.send(Outbound::Close);
        }

        info!("Student {} removed by teacher", request.student_name);
        self.broadcast_roster();
        Ok(())
    }

    pub fn active_poll_view(&self) -> ActivePollView {
        ActivePollView {
            poll: self.active_poll.clone(),
            results: self.tally.clone(),
        }
    }

    /// Closed polls kept in process, newest first.
    pub fn history(&self) -> Vec<PollRecord> {
        self.history.iter().cloned().collect()
    }

    /// `(students who answered, students connected)`.
    fn participation(&self) -> (usize, usize) {
        self.roster
            .values()
            .filter(|user| user.is_student())
            .fold((0, 0), |(answered, total), user| {
                (answered + usize::from(user.answered), total + 1)
            })
    }

    fn roster_list(&self) -> Vec<Participant> {
        self.roster.values().cloned().collect()
    }

    fn broadcast_roster(&self) {
        self.broadcast(ServerEvent::UsersUpdated(self.roster_list()));
    }

    fn broadcast(&self, event: ServerEvent) {
        for outbound in self.connections.values() {
            let _ = outbound.send(Outbound::Event(event.clone()));
        }
    }

    fn send(&self, id: ConnectionId, event: ServerEvent) {
        if let Some(outbound) = self.connections.get(&id) {
            let _ = outbound.send(Outbound::Event(event));
        }
    }

    fn send_error(&self, id: ConnectionId, err: &PollError) {
        self.send(id, ServerEvent::from(err));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::store::{tests::UnavailableStore, MemoryStore, PollStore};

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<(Uuid, Duration)>>,
    }

    impl RecordingScheduler {
        fn take(&self) -> Vec<(Uuid, Duration)> {
            std::mem::take(&mut *self.scheduled.lock().unwrap())
        }
    }

    impl Scheduler for RecordingScheduler {
        fn schedule_close(&self, poll_id: Uuid, after: Duration) {
            self.scheduled.lock().unwrap().push((poll_id, after));
        }
    }

    struct Harness {
        session: Session,
        scheduler: Arc<RecordingScheduler>,
        store: Arc<MemoryStore>,
        sink: StoreSink,
        next_id: ConnectionId,
    }

    struct Client {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<Outbound> {
            let mut out = Vec::new();
            while let Ok(item) = self.rx.try_recv() {
                out.push(item);
            }
            out
        }

        fn events(&mut self) -> Vec<ServerEvent> {
            self.drain()
                .into_iter()
                .filter_map(|out| match out {
                    Outbound::Event(event) => Some(event),
                    Outbound::Close => None,
                })
                .collect()
        }

        fn errors(&mut self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    ServerEvent::Error { message } => Some(message),
                    _ => None,
                })
                .collect()
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            default_time_limit: 60,
            all_answered_grace: Duration::from_millis(1000),
            history_limit: 50,
        }
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            Self::with_store(store.clone(), store)
        }

        fn with_store(store: Arc<MemoryStore>, backend: Arc<dyn PollStore>) -> Self {
            let (sink, _writer) = StoreSink::spawn(backend);
            let scheduler = Arc::new(RecordingScheduler::default());
            let session = Session::new(settings(), sink.clone(), scheduler.clone());
            Self {
                session,
                scheduler,
                store,
                sink,
                next_id: 1,
            }
        }

        fn connect(&mut self) -> Client {
            let id = self.next_id;
            self.next_id += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            self.session.connect(id, tx);
            Client { id, rx }
        }

        fn join(&mut self, name: &str, role: Role) -> Client {
            let mut client = self.connect();
            self.session.handle(
                client.id,
                ClientEvent::Join(JoinRequest {
                    name: name.into(),
                    role,
                }),
            );
            client.drain();
            client
        }

        fn create(&mut self, client: &Client, options: &[&str], time_limit: Option<u64>) {
            self.session.handle(
                client.id,
                ClientEvent::CreatePoll(CreatePollRequest {
                    question: "Q1".into(),
                    options: options.iter().map(|o| o.to_string()).collect(),
                    time_limit,
                }),
            );
        }

        fn answer(&mut self, client: &Client, option: &str) {
            self.session.handle(
                client.id,
                ClientEvent::SubmitAnswer(SubmitAnswerRequest {
                    selected_option: option.into(),
                }),
            );
        }

        fn active_id(&self) -> Uuid {
            self.session.active_poll_view().poll.unwrap().id
        }
    }

    #[tokio::test]
    async fn join_replies_with_snapshot_and_broadcasts_roster() {
        let mut h = Harness::new();
        let mut watcher = h.connect();
        let mut teacher = h.connect();

        h.session.handle(
            teacher.id,
            ClientEvent::Join(JoinRequest {
                name: "Grace".into(),
                role: Role::Teacher,
            }),
        );

        let events = teacher.events();
        match &events[0] {
            ServerEvent::PollState(state) => {
                assert!(state.active_poll.is_none());
                assert!(!state.has_answered);
                assert_eq!(state.roster.len(), 1);
            }
            other => panic!("expected poll-state, got {other:?}"),
        }
        assert!(matches!(&events[1], ServerEvent::UsersUpdated(roster) if roster.len() == 1));
        assert!(matches!(
            watcher.events().as_slice(),
            [ServerEvent::UsersUpdated(roster)] if roster[0].name == "Grace"
        ));
    }

    #[tokio::test]
    async fn duplicate_names_are_allowed() {
        let mut h = Harness::new();
        let _a = h.join("Sam", Role::Student);
        let _b = h.join("Sam", Role::Student);
        assert_eq!(h.session.roster_list().len(), 2);
    }

    #[tokio::test]
    async fn full_class_answering_closes_the_poll_after_grace() {
        let mut h = Harness::new();
        let mut teacher = h.join("Grace", Role::Teacher);
        h.create(&teacher, &["A", "B"], Some(0));
        let poll_id = h.active_id();
        assert!(h.scheduler.take().is_empty(), "no timer for unlimited polls");

        let mut ada = h.join("Ada", Role::Student);
        let bob = h.join("Bob", Role::Student);
        teacher.drain();

        h.answer(&ada, "A");
        assert!(h.scheduler.take().is_empty());
        h.answer(&bob, "B");

        let events = teacher.events();
        match events.last() {
            Some(ServerEvent::PollResultsUpdated {
                tally,
                answered_count,
                total_students,
            }) => {
                assert_eq!(tally.get("A"), Some(1));
                assert_eq!(tally.get("B"), Some(1));
                assert_eq!(*answered_count, 2);
                assert_eq!(*total_students, 2);
            }
            other => panic!("expected results update, got {other:?}"),
        }
        assert_eq!(
            h.scheduler.take(),
            vec![(poll_id, Duration::from_millis(1000))]
        );

        h.session.close_poll_if_current(poll_id);
        match ada.events().last() {
            Some(ServerEvent::PollEnded { poll, tally }) => {
                assert_eq!(poll.id, poll_id);
                assert!(!poll.is_active);
                assert_eq!(tally.total(), 2);
            }
            other => panic!("expected poll-ended, got {other:?}"),
        }
        assert!(h.session.active_poll_view().poll.is_none());
        assert_eq!(h.session.active_poll_view().results.total(), 2);
    }

    #[tokio::test]
    async fn second_answer_is_rejected_and_tally_unchanged() {
        let mut h = Harness::new();
        let teacher = h.join("Grace", Role::Teacher);
        let mut ada = h.join("Ada", Role::Student);
        let _bob = h.join("Bob", Role::Student);
        h.create(&teacher, &["A", "B"], None);

        h.answer(&ada, "A");
        ada.drain();
        h.answer(&ada, "B");

        assert_eq!(ada.errors(), vec!["You have already answered this poll"]);
        let tally = h.session.active_poll_view().results;
        assert_eq!(tally.get("A"), Some(1));
        assert_eq!(tally.get("B"), Some(0));
    }

    #[tokio::test]
    async fn invalid_option_is_rejected() {
        let mut h = Harness::new();
        let teacher = h.join("Grace", Role::Teacher);
        let mut ada = h.join("Ada", Role::Student);
        h.create(&teacher, &["A", "B"], None);
        ada.drain();

        h.answer(&ada, "C");

        assert_eq!(ada.errors(), vec!["Invalid option selected"]);
        assert_eq!(h.session.active_poll_view().results.total(), 0);
        assert!(!h.session.roster[&ada.id].answered);
    }

    #[tokio::test]
    async fn answer_rejections_follow_role_then_state() {
        let mut h = Harness::new();
        let mut teacher = h.join("Grace", Role::Teacher);
        let mut ada = h.join("Ada", Role::Student);

        h.answer(&ada, "A");
        assert_eq!(ada.errors(), vec!["No active poll to answer"]);

        h.create(&teacher, &["A"], None);
        teacher.drain();
        h.answer(&teacher, "A");
        assert_eq!(teacher.errors(), vec!["Only students can submit answers"]);
    }

    #[tokio::test]
    async fn cannot_create_while_students_are_still_answering() {
        let mut h = Harness::new();
        let mut teacher = h.join("Grace", Role::Teacher);
        let ada = h.join("Ada", Role::Student);
        let _bob = h.join("Bob", Role::Student);
        h.create(&teacher, &["A", "B"], None);
        let first = h.active_id();
        h.answer(&ada, "A");
        teacher.drain();

        h.create(&teacher, &["C", "D"], None);

        assert_eq!(
            teacher.errors(),
            vec!["Cannot create new poll. Not all students have answered the current question."]
        );
        assert_eq!(h.active_id(), first);
    }

    #[tokio::test]
    async fn replacing_a_completed_poll_closes_it_first() {
        let mut h = Harness::new();
        let mut teacher = h.join("Grace", Role::Teacher);
        let ada = h.join("Ada", Role::Student);
        h.create(&teacher, &["A", "B"], Some(30));
        let first = h.active_id();
        h.answer(&ada, "B");
        teacher.drain();

        h.create(&teacher, &["C", "D"], Some(30));
        let second = h.active_id();
        assert_ne!(first, second);

        let events = teacher.events();
        assert!(matches!(&events[0], ServerEvent::PollEnded { poll, .. } if poll.id == first));
        match &events[1] {
            ServerEvent::NewPoll { tally, .. } => {
                assert_eq!(tally.get("C"), Some(0));
                assert!(!tally.contains("A"));
            }
            other => panic!("expected new-poll, got {other:?}"),
        }
        assert!(h.session.roster.values().all(|user| !user.answered));
        assert_eq!(h.session.history()[0].poll.id, first);
    }

    #[tokio::test]
    async fn stale_timer_does_not_close_a_newer_poll() {
        let mut h = Harness::new();
        let teacher = h.join("Grace", Role::Teacher);
        h.create(&teacher, &["A"], Some(10));
        let first = h.active_id();
        h.session.handle(teacher.id, ClientEvent::EndPoll);
        h.create(&teacher, &["B"], Some(10));
        let second = h.active_id();

        h.session.close_poll_if_current(first);

        assert_eq!(h.active_id(), second);
        let scheduled: Vec<Uuid> = h.scheduler.take().into_iter().map(|(id, _)| id).collect();
        assert_eq!(scheduled, vec![first, second]);
    }

    #[tokio::test]
    async fn missing_time_limit_uses_the_default() {
        let mut h = Harness::new();
        let teacher = h.join("Grace", Role::Teacher);
        h.create(&teacher, &["A"], None);
        let poll_id = h.active_id();
        assert_eq!(h.scheduler.take(), vec![(poll_id, Duration::from_secs(60))]);
    }

    #[tokio::test]
    async fn create_poll_validates_payload() {
        let mut h = Harness::new();
        let mut teacher = h.join("Grace", Role::Teacher);
        h.create(&teacher, &[], None);
        h.create(&teacher, &["A", " A "], None);
        assert_eq!(
            teacher.errors(),
            vec![
                "A poll needs at least one non-empty option",
                "Poll options must be distinct"
            ]
        );
        assert!(h.session.active_poll_view().poll.is_none());
    }

    #[tokio::test]
    async fn only_teachers_manage_polls() {
        let mut h = Harness::new();
        let teacher = h.join("Grace", Role::Teacher);
        let mut ada = h.join("Ada", Role::Student);
        h.create(&ada, &["A"], None);
        h.create(&teacher, &["A"], None);
        ada.drain();
        h.session.handle(ada.id, ClientEvent::EndPoll);

        assert_eq!(ada.errors(), vec!["Only teachers can end polls"]);
        assert!(h.session.active_poll_view().poll.is_some());
    }

    #[tokio::test]
    async fn tally_sum_matches_accepted_answers() {
        let mut h = Harness::new();
        let teacher = h.join("Grace", Role::Teacher);
        let students: Vec<Client> = (0..5)
            .map(|i| h.join(&format!("S{i}"), Role::Student))
            .collect();
        h.create(&teacher, &["A", "B", "C"], Some(0));

        for (i, student) in students.iter().enumerate().take(4) {
            h.answer(student, ["A", "B", "C"][i % 3]);
        }
        h.answer(&students[0], "C");

        assert_eq!(h.session.active_poll_view().results.total(), 4);
        assert!(h.scheduler.take().is_empty());
    }

    #[tokio::test]
    async fn removed_student_is_told_and_disconnected() {
        let mut h = Harness::new();
        let mut teacher = h.join("Grace", Role::Teacher);
        let mut ada = h.join("Ada", Role::Student);
        let mut bob = h.join("Bob", Role::Student);
        teacher.drain();
        ada.drain();

        h.session.handle(
            teacher.id,
            ClientEvent::RemoveStudent(RemoveStudentRequest {
                student_name: "Bob".into(),
            }),
        );

        assert_eq!(
            bob.drain(),
            vec![Outbound::Event(ServerEvent::RemovedByTeacher), Outbound::Close]
        );
        match teacher.events().as_slice() {
            [ServerEvent::UsersUpdated(roster)] => {
                let names: Vec<&str> = roster.iter().map(|u| u.name.as_str()).collect();
                assert_eq!(names, vec!["Grace", "Ada"]);
            }
            other => panic!("expected roster update, got {other:?}"),
        }
        assert_eq!(ada.events().len(), 1);

        // The socket closing afterwards must not produce another roster broadcast.
        h.session.disconnect(bob.id);
        assert!(teacher.events().is_empty());
    }

    #[tokio::test]
    async fn remove_student_picks_the_earliest_match() {
        let mut h = Harness::new();
        let teacher = h.join("Grace", Role::Teacher);
        let mut first = h.join("Sam", Role::Student);
        let mut second = h.join("Sam", Role::Student);

        h.session.handle(
            teacher.id,
            ClientEvent::RemoveStudent(RemoveStudentRequest {
                student_name: "Sam".into(),
            }),
        );

        assert!(first.drain().contains(&Outbound::Close));
        assert!(!second.drain().contains(&Outbound::Close));
    }

    #[tokio::test]
    async fn remove_student_by_non_teacher_is_rejected() {
        let mut h = Harness::new();
        let _teacher = h.join("Grace", Role::Teacher);
        let mut ada = h.join("Ada", Role::Student);
        let _bob = h.join("Bob", Role::Student);

        h.session.handle(
            ada.id,
            ClientEvent::RemoveStudent(RemoveStudentRequest {
                student_name: "Bob".into(),
            }),
        );

        assert_eq!(ada.errors(), vec!["Only teachers can remove students"]);
        assert_eq!(h.session.roster_list().len(), 3);
    }

    #[tokio::test]
    async fn chat_requires_joining() {
        let mut h = Harness::new();
        let mut stranger = h.connect();
        let mut ada = h.join("Ada", Role::Student);

        h.session.handle(
            stranger.id,
            ClientEvent::SendMessage(SendMessageRequest {
                message: "hi".into(),
            }),
        );
        assert_eq!(stranger.errors(), vec!["User not found"]);

        h.session.handle(
            ada.id,
            ClientEvent::SendMessage(SendMessageRequest {
                message: "hello".into(),
            }),
        );
        match stranger.events().as_slice() {
            [ServerEvent::NewMessage(message)] => {
                assert_eq!(message.sender, "Ada");
                assert_eq!(message.role, Role::Student);
                assert_eq!(message.text, "hello");
            }
            other => panic!("expected chat message, got {other:?}"),
        }
        assert_eq!(ada.events().len(), 1);
    }

    #[tokio::test]
    async fn teacher_leaving_keeps_the_poll_active() {
        let mut h = Harness::new();
        let teacher = h.join("Grace", Role::Teacher);
        let mut ada = h.join("Ada", Role::Student);
        h.create(&teacher, &["A"], None);
        ada.drain();

        h.session.disconnect(teacher.id);

        assert!(h.session.active_poll_view().poll.is_some());
        assert!(matches!(
            ada.events().as_slice(),
            [ServerEvent::UsersUpdated(roster)] if roster.len() == 1
        ));
    }

    #[tokio::test]
    async fn answers_are_persisted_through_the_sink() {
        let mut h = Harness::new();
        let teacher = h.join("Grace", Role::Teacher);
        let ada = h.join("Ada", Role::Student);
        let _bob = h.join("Bob", Role::Student);
        h.create(&teacher, &["A", "B"], None);
        let poll_id = h.active_id();
        h.answer(&ada, "B");
        h.session.handle(teacher.id, ClientEvent::EndPoll);
        h.sink.flush().await;

        let stored = h.store.recent_polls(1).await.unwrap();
        assert_eq!(stored[0].poll.id, poll_id);
        assert_eq!(stored[0].results.get("B"), Some(1));
        assert_eq!(stored[0].total_answers, 1);
        assert_eq!(stored[0].total_students, 2);
        assert!(stored[0].ended_at.is_some());
        assert_eq!(h.store.participant_history("Ada")[0].poll_id, poll_id);
    }

    #[tokio::test]
    async fn store_outage_keeps_live_results_and_local_history() {
        let mut h = Harness::with_store(Arc::new(MemoryStore::new()), Arc::new(UnavailableStore));
        let mut teacher = h.join("Grace", Role::Teacher);
        let mut ada = h.join("Ada", Role::Student);
        let _bob = h.join("Bob", Role::Student);
        h.create(&teacher, &["A", "B"], None);
        h.answer(&ada, "A");
        h.session.handle(teacher.id, ClientEvent::EndPoll);
        h.sink.flush().await;

        let ada_events = ada.events();
        assert!(ada_events.iter().any(|e| matches!(
            e,
            ServerEvent::PollResultsUpdated { tally, .. } if tally.get("A") == Some(1)
        )));
        assert!(ada_events.iter().any(|e| matches!(
            e,
            ServerEvent::Error { message } if message.contains("saving it failed")
        )));
        assert!(ada_events
            .iter()
            .any(|e| matches!(e, ServerEvent::PollEnded { .. })));
        assert!(teacher
            .errors()
            .iter()
            .any(|message| message.contains("only be kept in memory")));
        assert_eq!(h.session.history().len(), 1);
        assert_eq!(h.session.history()[0].results.get("A"), Some(1));
    }

    #[tokio::test]
    async fn history_is_bounded_and_newest_first() {
        let mut h = Harness::new();
        h.session.settings.history_limit = 2;
        let teacher = h.join("Grace", Role::Teacher);
        let mut ids = Vec::new();
        for _ in 0..3 {
            h.create(&teacher, &["A"], Some(0));
            ids.push(h.active_id());
            h.session.handle(teacher.id, ClientEvent::EndPoll);
        }

        let history: Vec<Uuid> = h.session.history().iter().map(|r| r.poll.id).collect();
        assert_eq!(history, vec![ids[2], ids[1]]);
    }

    #[tokio::test]
    async fn rejoining_keeps_the_answered_flag() {
        let mut h = Harness::new();
        let teacher = h.join("Grace", Role::Teacher);
        let mut ada = h.join("Ada", Role::Student);
        let _bob = h.join("Bob", Role::Student);
        h.create(&teacher, &["A", "B"], None);
        h.answer(&ada, "A");
        ada.drain();

        h.session.handle(
            ada.id,
            ClientEvent::Join(JoinRequest {
                name: "Ada".into(),
                role: Role::Student,
            }),
        );
        match ada.events().first() {
            Some(ServerEvent::PollState(state)) => assert!(state.has_answered),
            other => panic!("expected poll-state, got {other:?}"),
        }

        h.answer(&ada, "A");
        assert_eq!(ada.errors(), vec!["You have already answered this poll"]);
        let tally = h.session.active_poll_view().results;
        assert_eq!(tally.get("A"), Some(1));
        assert_eq!(tally.total(), 1);
    }

    #[tokio::test]
    async fn events_from_a_removed_connection_are_ignored() {
        let mut h = Harness::new();
        let mut teacher = h.join("Grace", Role::Teacher);
        let bob = h.join("Bob", Role::Student);
        h.session.handle(
            teacher.id,
            ClientEvent::RemoveStudent(RemoveStudentRequest {
                student_name: "Bob".into(),
            }),
        );
        teacher.drain();

        h.session.handle(
            bob.id,
            ClientEvent::Join(JoinRequest {
                name: "Bob".into(),
                role: Role::Student,
            }),
        );

        let names: Vec<String> = h.session.roster_list().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["Grace"]);
        assert!(teacher.events().is_empty());
    }
}
