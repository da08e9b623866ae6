use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::platform::dispatch::Dispatcher;
use crate::platform::{CommandSpec, InboundEvent, KeyboardItem, OutboundMessage};
use crate::step::{Step, StepContext, StepTable, Transition};
use crate::store::dedup::EventDedupStore;
use crate::store::tokens::CallbackTokenStore;
use crate::store::users::UserStore;

/// Upper bound on delegation hops; a table that chains deeper than this is
/// cyclic.
const MAX_DELEGATION_HOPS: usize = 32;

/// Drives the per-user dialog state machine from canonical events.
///
/// `handle` is the per-event containment boundary: whatever goes wrong while
/// processing one event is logged there and never reaches another event or
/// the caller.
pub struct StepEngine {
    steps: StepTable,
    users: UserStore,
    dedup: EventDedupStore,
    tokens: CallbackTokenStore,
    dispatcher: Arc<Dispatcher>,
    // One async mutex per uid so read-transition-write sequences for the same
    // user cannot interleave. Entries are never removed; the set of users is
    // small and long-lived by design.
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StepEngine {
    pub fn new(
        steps: StepTable,
        users: UserStore,
        dedup: EventDedupStore,
        tokens: CallbackTokenStore,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            steps,
            users,
            dedup,
            tokens,
            dispatcher,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Commands to advertise on each platform: every step carrying both a
    /// command and a description.
    pub fn commands(&self) -> Vec<CommandSpec> {
        commands_from(&self.steps)
    }

    /// Process one inbound event, containing every failure.
    pub async fn handle(&self, event: InboundEvent) {
        let platform = event.platform;
        let chat_id = event.chat_id.clone();
        if let Err(e) = self.process(event).await {
            error!(
                "Failed to process event from {} chat {}: {:#}",
                platform, chat_id, e
            );
        }
    }

    async fn process(&self, mut event: InboundEvent) -> Result<()> {
        // Recover the payload behind a callback token, if the event carries
        // one. An unknown token simply leaves the payload empty.
        if event.payload.is_none() {
            if let Some(token) = &event.callback_token {
                event.payload = self.tokens.get(token).await?;
            }
        }

        if self
            .dedup
            .register(event.event_id.as_deref(), event.platform)
            .await?
        {
            debug!(
                "Skipping already-seen event {:?} from {}",
                event.event_id, event.platform
            );
            return Ok(());
        }

        // Serialize processing per user so two near-simultaneous events
        // cannot interleave their read-transition-write sequences.
        let lock = self.user_lock(&event.user_id, &event).await;
        let _guard = lock.lock().await;

        let mut user = self.users.get(&event.user_id, event.platform).await?;

        // A recognized command always overrides the stored step.
        let mut active = user.step.clone();
        if let Some(command) = &event.command {
            if let Some((name, _)) = self
                .steps
                .iter()
                .find(|(_, step)| step.command() == Some(command.as_str()))
            {
                active = Some(name.clone());
            }
        }

        // No active step, or one the table does not define: silently ignore.
        let Some(active) = active else {
            return Ok(());
        };
        let Some(step) = self.steps.get(&active) else {
            return Ok(());
        };

        let cx = StepContext {
            event: &event,
            user: &user,
            prev_step: &active,
            dispatcher: self.dispatcher.as_ref(),
        };

        // Trampoline: a step may delegate the transition decision to another
        // step, which renders nothing for the steps hopped over.
        let mut next = active.clone();
        let mut transition = step.advance(&cx).await?;
        let mut hops = 0;
        loop {
            match transition {
                Transition::Stay => break,
                Transition::Goto(name) => {
                    next = name;
                    break;
                }
                Transition::Delegate(name) => {
                    hops += 1;
                    if hops > MAX_DELEGATION_HOPS {
                        return Err(anyhow!(
                            "delegation chain exceeded {} hops starting from '{}'",
                            MAX_DELEGATION_HOPS,
                            active
                        ));
                    }
                    let delegate = self
                        .steps
                        .get(&name)
                        .ok_or_else(|| anyhow!("step '{}' delegated to unknown step '{}'", next, name))?;
                    next = name;
                    transition = delegate.advance(&cx).await?;
                }
            }
        }

        if let Some(target) = self.steps.get(&next) {
            let prompt = target.render(&cx).await?;
            if let Some(prompt) = prompt.filter(|p| !p.is_empty()) {
                let options = target.options(&cx).await?;
                let keyboard = options
                    .into_iter()
                    .map(|option| KeyboardItem {
                        label: option.label().to_string(),
                        intent: option.intent().map(str::to_string),
                        payload: Some(json!({ "key": option.key() })),
                    })
                    .collect();

                let message = OutboundMessage {
                    text: prompt,
                    keyboard,
                    ..Default::default()
                };
                self.dispatcher
                    .send(event.platform, &event.chat_id, message)
                    .await;
            }

            if user.step.as_deref() != Some(next.as_str()) {
                info!("User {} moved to step '{}'", user.uid, next);
                user.step = Some(next);
                self.users.save(&user).await?;
            }
        }

        Ok(())
    }

    async fn user_lock(&self, user_id: &str, event: &InboundEvent) -> Arc<Mutex<()>> {
        let uid = crate::store::users::UserRecord::uid_for(user_id, event.platform);
        let mut locks = self.user_locks.lock().await;
        Arc::clone(locks.entry(uid).or_default())
    }
}

/// Commands derivable from a step table: every step carrying both a command
/// and a description.
pub(crate) fn commands_from(steps: &StepTable) -> Vec<CommandSpec> {
    let mut commands: Vec<CommandSpec> = steps
        .values()
        .filter_map(|step| match (step.command(), step.description()) {
            (Some(command), Some(description)) => Some(CommandSpec {
                name: display_name(command),
                command: command.to_string(),
                description: description.to_string(),
            }),
            _ => None,
        })
        .collect();
    commands.sort_by(|a, b| a.command.cmp(&b.command));
    commands
}

/// VK-style capitalized commands are displayed bare; everything else gets the
/// slash prefix.
pub(crate) fn display_name(command: &str) -> String {
    if command.chars().next().is_some_and(|c| c.is_uppercase()) {
        command.to_string()
    } else {
        format!("/{command}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::dispatch::testutil::{RecordingAdapter, SentMessage};
    use crate::platform::PlatformKind;
    use crate::step::{OptionItem, Step};
    use crate::store::Store;
    use async_trait::async_trait;

    const SECRET: &str = "hunter2";

    /// Greeting step that immediately delegates to `start`.
    struct Hello;

    #[async_trait]
    impl Step for Hello {
        fn command(&self) -> Option<&str> {
            Some("Begin")
        }
        fn description(&self) -> Option<&str> {
            Some("Registration")
        }
        async fn render(&self, _cx: &StepContext<'_>) -> Result<Option<String>> {
            Ok(Some("Hi".to_string()))
        }
        async fn advance(&self, _cx: &StepContext<'_>) -> Result<Transition> {
            Ok(Transition::Delegate("start".to_string()))
        }
    }

    /// Secret-code gate: stays until the code matches, then moves on.
    struct Start;

    #[async_trait]
    impl Step for Start {
        fn command(&self) -> Option<&str> {
            Some("start")
        }
        fn description(&self) -> Option<&str> {
            Some("Registration")
        }
        async fn render(&self, cx: &StepContext<'_>) -> Result<Option<String>> {
            if cx.event.command.is_none() && cx.event.text.as_deref().is_some_and(|t| !t.is_empty())
            {
                Ok(Some("The code is incorrect, try again:".to_string()))
            } else {
                Ok(Some("Enter the verification code:".to_string()))
            }
        }
        async fn advance(&self, cx: &StepContext<'_>) -> Result<Transition> {
            if cx.event.command.is_none() && cx.event.text.as_deref() == Some(SECRET) {
                Ok(Transition::Goto("role".to_string()))
            } else {
                Ok(Transition::Stay)
            }
        }
    }

    /// Choice step offering keyed options.
    struct Role;

    #[async_trait]
    impl Step for Role {
        async fn render(&self, _cx: &StepContext<'_>) -> Result<Option<String>> {
            Ok(Some("What is your role?".to_string()))
        }
        async fn advance(&self, cx: &StepContext<'_>) -> Result<Transition> {
            let key = cx
                .event
                .payload
                .as_ref()
                .and_then(|p| p.get("key"))
                .and_then(|k| k.as_str());
            match key {
                Some(_) => Ok(Transition::Goto("done".to_string())),
                None => Ok(Transition::Stay),
            }
        }
        async fn options(&self, _cx: &StepContext<'_>) -> Result<Vec<OptionItem>> {
            Ok(vec![
                OptionItem::Label("Mentor".to_string()),
                OptionItem::Keyed {
                    key: "mentee".to_string(),
                    label: "Mentee".to_string(),
                    intent: Some("primary".to_string()),
                },
            ])
        }
    }

    /// Terminal step with no visible prompt.
    struct Done;

    #[async_trait]
    impl Step for Done {
        async fn render(&self, _cx: &StepContext<'_>) -> Result<Option<String>> {
            Ok(None)
        }
    }

    /// Step that always delegates to a fixed target.
    struct DelegateTo(&'static str);

    #[async_trait]
    impl Step for DelegateTo {
        async fn render(&self, _cx: &StepContext<'_>) -> Result<Option<String>> {
            Ok(Some(format!("should never render on the way to {}", self.0)))
        }
        async fn advance(&self, _cx: &StepContext<'_>) -> Result<Transition> {
            Ok(Transition::Delegate(self.0.to_string()))
        }
    }

    struct Fixture {
        engine: StepEngine,
        adapter: Arc<RecordingAdapter>,
        users: UserStore,
    }

    fn fixture(steps: StepTable) -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let users = UserStore::new(store.connection());
        let dedup = EventDedupStore::new(store.connection());
        let tokens = CallbackTokenStore::new(store.connection());
        let adapter = Arc::new(RecordingAdapter::new(PlatformKind::Telegram));
        let dispatcher = Arc::new(Dispatcher::new(
            vec![adapter.clone() as Arc<dyn crate::platform::PlatformAdapter>],
            tokens.clone(),
        ));
        Fixture {
            engine: StepEngine::new(steps, users.clone(), dedup, tokens, dispatcher),
            adapter,
            users,
        }
    }

    fn table() -> StepTable {
        let mut steps = StepTable::new();
        steps.insert("hello".to_string(), Arc::new(Hello) as Arc<dyn Step>);
        steps.insert("start".to_string(), Arc::new(Start));
        steps.insert("role".to_string(), Arc::new(Role));
        steps.insert("done".to_string(), Arc::new(Done));
        steps
    }

    fn event(text: Option<&str>, command: Option<&str>) -> InboundEvent {
        let mut event = InboundEvent::new(PlatformKind::Telegram, "100", "42");
        event.text = text.map(str::to_string);
        event.command = command.map(str::to_string);
        event
    }

    async fn sent(adapter: &RecordingAdapter) -> Vec<SentMessage> {
        adapter.sent.lock().await.clone()
    }

    async fn current_step(users: &UserStore) -> Option<String> {
        users
            .get("42", PlatformKind::Telegram)
            .await
            .unwrap()
            .step
    }

    #[tokio::test]
    async fn test_fresh_user_start_command() {
        let f = fixture(table());

        f.engine.handle(event(Some("/start"), Some("start"))).await;

        let sent = sent(&f.adapter).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, "100");
        assert_eq!(sent[0].text, "Enter the verification code:");
        assert!(sent[0].keyboard.is_empty());
        assert_eq!(current_step(&f.users).await.as_deref(), Some("start"));
    }

    #[tokio::test]
    async fn test_wrong_code_stays_without_state_write() {
        let f = fixture(table());
        f.engine.handle(event(Some("/start"), Some("start"))).await;

        f.engine.handle(event(Some("wrongcode"), None)).await;

        let sent = sent(&f.adapter).await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].text, "The code is incorrect, try again:");
        assert_eq!(current_step(&f.users).await.as_deref(), Some("start"));
    }

    #[tokio::test]
    async fn test_correct_code_moves_on_and_offers_options() {
        let f = fixture(table());
        f.engine.handle(event(Some("/start"), Some("start"))).await;

        f.engine.handle(event(Some(SECRET), None)).await;

        let sent = sent(&f.adapter).await;
        assert_eq!(sent[1].text, "What is your role?");
        assert_eq!(sent[1].keyboard.len(), 2);
        assert_eq!(sent[1].keyboard[0].label, "Mentor");
        assert_eq!(sent[1].keyboard[1].label, "Mentee");
        assert_eq!(sent[1].keyboard[1].intent.as_deref(), Some("primary"));
        assert_eq!(current_step(&f.users).await.as_deref(), Some("role"));
    }

    #[tokio::test]
    async fn test_button_press_round_trips_through_token() {
        let f = fixture(table());
        f.engine.handle(event(Some("/start"), Some("start"))).await;
        f.engine.handle(event(Some(SECRET), None)).await;

        let token = sent(&f.adapter).await[1].keyboard[1]
            .token
            .clone()
            .unwrap();

        let mut press = event(None, None);
        press.callback_token = Some(token);
        f.engine.handle(press).await;

        // Keyed option's key, not its label, came back and drove the
        // transition to the silent terminal step.
        assert_eq!(current_step(&f.users).await.as_deref(), Some("done"));
        // `done` renders nothing.
        assert_eq!(sent(&f.adapter).await.len(), 2);
    }

    #[tokio::test]
    async fn test_command_overrides_stored_step() {
        let f = fixture(table());
        f.engine.handle(event(Some("/start"), Some("start"))).await;
        f.engine.handle(event(Some(SECRET), None)).await;
        assert_eq!(current_step(&f.users).await.as_deref(), Some("role"));

        // Back on `role`, the start command still routes through `start`.
        f.engine.handle(event(Some("/start"), Some("start"))).await;

        let sent = sent(&f.adapter).await;
        assert_eq!(sent.last().unwrap().text, "Enter the verification code:");
        assert_eq!(current_step(&f.users).await.as_deref(), Some("start"));
    }

    #[tokio::test]
    async fn test_delegation_chain_renders_only_terminal_step() {
        let mut steps = StepTable::new();
        steps.insert(
            "a".to_string(),
            Arc::new(DelegateTo("b")) as Arc<dyn Step>,
        );
        steps.insert("b".to_string(), Arc::new(DelegateTo("c")));
        steps.insert("c".to_string(), Arc::new(DelegateTo("d")));
        steps.insert("d".to_string(), Arc::new(Role));
        let f = fixture(steps);

        let mut user = f.users.get("42", PlatformKind::Telegram).await.unwrap();
        user.step = Some("a".to_string());
        f.users.save(&user).await.unwrap();

        f.engine.handle(event(Some("anything"), None)).await;

        let sent = sent(&f.adapter).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "What is your role?");
        assert_eq!(current_step(&f.users).await.as_deref(), Some("d"));
    }

    #[tokio::test]
    async fn test_delegation_cycle_aborts_without_state_change() {
        let mut steps = StepTable::new();
        steps.insert(
            "a".to_string(),
            Arc::new(DelegateTo("b")) as Arc<dyn Step>,
        );
        steps.insert("b".to_string(), Arc::new(DelegateTo("a")));
        let f = fixture(steps);

        let mut user = f.users.get("42", PlatformKind::Telegram).await.unwrap();
        user.step = Some("a".to_string());
        f.users.save(&user).await.unwrap();

        f.engine.handle(event(Some("x"), None)).await;

        assert!(sent(&f.adapter).await.is_empty());
        assert_eq!(current_step(&f.users).await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_silent_step_persists_without_sending() {
        let f = fixture(table());
        let mut user = f.users.get("42", PlatformKind::Telegram).await.unwrap();
        user.step = Some("role".to_string());
        f.users.save(&user).await.unwrap();

        let mut press = event(None, None);
        press.payload = Some(json!({"key": "mentor"}));
        f.engine.handle(press).await;

        assert!(sent(&f.adapter).await.is_empty());
        assert_eq!(current_step(&f.users).await.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_unknown_stored_step_is_ignored() {
        let f = fixture(table());
        let mut user = f.users.get("42", PlatformKind::Telegram).await.unwrap();
        user.step = Some("vanished".to_string());
        f.users.save(&user).await.unwrap();

        f.engine.handle(event(Some("hi"), None)).await;

        assert!(sent(&f.adapter).await.is_empty());
        assert_eq!(current_step(&f.users).await.as_deref(), Some("vanished"));
    }

    #[tokio::test]
    async fn test_no_step_and_no_command_is_ignored() {
        let f = fixture(table());

        f.engine.handle(event(Some("hello there"), None)).await;

        assert!(sent(&f.adapter).await.is_empty());
        assert_eq!(current_step(&f.users).await, None);
    }

    #[tokio::test]
    async fn test_duplicate_event_is_processed_once() {
        let f = fixture(table());

        let mut first = event(Some("/start"), Some("start"));
        first.event_id = Some("100:5".to_string());
        let second = first.clone();

        f.engine.handle(first).await;
        f.engine.handle(second).await;

        assert_eq!(sent(&f.adapter).await.len(), 1);
    }

    #[tokio::test]
    async fn test_commands_derived_from_step_table() {
        let f = fixture(table());
        let commands = f.engine.commands();

        assert_eq!(commands.len(), 2);
        // Capitalized VK-style command keeps its bare name.
        assert_eq!(commands[0].command, "Begin");
        assert_eq!(commands[0].name, "Begin");
        assert_eq!(commands[1].command, "start");
        assert_eq!(commands[1].name, "/start");
    }
}
