mod common;

#[cfg(test)]
mod tests {
    use super::common::{spawn_backend, spawn_relay, FakeBackend};
    use chatrelay::client::{ChatClient, EntryStatus, RelayApiClient};
    use chatrelay::poller::{PollStop, PollerConfig};
    use chatrelay::tags;
    use chatrelay::{Note, Role};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn fast_polls() -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(20),
            max_idle_polls: 5,
            max_duration: Duration::from_secs(10),
        }
    }

    async fn chat_against(fake: Arc<FakeBackend>) -> ChatClient {
        let backend_url = spawn_backend(fake).await;
        let relay_url = spawn_relay(&backend_url).await;
        ChatClient::new(
            RelayApiClient::new(reqwest::Client::new(), relay_url),
            fast_polls(),
        )
    }

    #[tokio::test]
    async fn test_hello_yields_two_assistant_chunks() {
        let fake = Arc::new(FakeBackend::with_script(vec![
            Note::new("Thinking..."),
            Note::new("Hello! How can I help? <taskcompleted/>").with_agent("greeter"),
        ]));
        let mut chat = chat_against(fake.clone()).await;

        let outcome = chat.send("hello", &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.chunks, 2);
        assert!(!outcome.paused);
        assert_eq!(chat.assistant_chunks().len(), 2);
        assert!(tags::is_completed(chat.assistant_chunks()[1]));
        assert!(chat
            .transcript()
            .iter()
            .all(|e| e.status != EntryStatus::Streaming));

        let created = fake.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, outcome.session_id.as_str());
        assert_eq!(created[0].0.len(), 32);
        assert_eq!(created[0].1.len(), 1);
        assert_eq!(created[0].1[0].role, Role::User);
        assert_eq!(created[0].1[0].content, "hello");
    }

    #[tokio::test]
    async fn test_each_finished_run_gets_a_fresh_session() {
        let fake = Arc::new(FakeBackend::with_runs(vec![
            vec![Note::new("answer to run 1 <taskcompleted/>")],
            vec![Note::new("answer to run 2 <taskcompleted/>")],
        ]));
        let mut chat = chat_against(fake.clone()).await;
        let cancel = CancellationToken::new();

        let first = chat.send("first", &cancel).await.unwrap();
        let second = chat.send("second", &cancel).await.unwrap();

        assert_ne!(first.session_id, second.session_id);
        assert_eq!(chat.session_id(), Some(&second.session_id));
        let chunks = chat.assistant_chunks();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains("run 1"));
        assert!(chunks[1].contains("run 2"));

        let created = fake.created.lock().unwrap().clone();
        // The second request still carries the whole history: user, assistant, user.
        assert_eq!(created[1].1.len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_mid_reply_marks_placeholder_cancelled() {
        use axum::{body::Body, routing::post, Router};
        use chatrelay::relay::RelayFrame;
        use futures_util::{stream, StreamExt};
        use std::convert::Infallible;

        // A relay that sends the preface, then takes far too long to say anything else.
        let slow_chat = || async {
            let preface = stream::iter(vec![Ok::<_, Infallible>(
                RelayFrame::status("Thinking...").encode(),
            )]);
            let late = stream::once(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, Infallible>(RelayFrame::Text("too late<br/><br/>".to_string()).encode())
            });
            Body::from_stream(preface.chain(late))
        };
        let app = Router::new().route("/api/chat", post(slow_chat));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut chat = ChatClient::new(
            RelayApiClient::new(reqwest::Client::new(), format!("http://{}", addr)),
            fast_polls(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), chat.send("hello", &cancel))
            .await
            .expect("send should stop once cancelled")
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.chunks, 0);
        assert!(!outcome.paused);
        assert!(chat.assistant_chunks().is_empty());
        let last = chat.transcript().last().unwrap();
        assert_eq!(last.status, EntryStatus::Cancelled);
        assert_eq!(last.content, "Thinking...");
        assert!(chat
            .transcript()
            .iter()
            .all(|e| e.status != EntryStatus::Streaming));
    }

    #[tokio::test]
    async fn test_pause_respond_and_fresh_session_after() {
        let mut fake = FakeBackend::with_script(vec![
            Note::new("Which table should I use? <taskpaused/>").with_agent("user_input"),
        ]);
        fake.after_submit = vec![
            Note::new("Using the users table").with_agent("sql"),
            Note::new("There are 42 rows <taskcompleted/>").with_agent("answerer"),
        ];
        let fake = Arc::new(fake);
        let mut chat = chat_against(fake.clone()).await;
        let cancel = CancellationToken::new();

        let sent = chat.send("count the users", &cancel).await.unwrap();
        assert!(sent.paused);
        assert!(chat.is_awaiting_reply());
        assert!(chat.assistant_chunks()[0].contains("Waiting for your response"));

        let resumed = chat.respond("users", &cancel).await.unwrap();
        assert_eq!(resumed.stop, PollStop::Completed);
        assert_eq!(resumed.notes_appended, 2);
        assert!(!chat.is_awaiting_reply());
        assert_eq!(chat.assistant_chunks().len(), 3);
        assert_eq!(
            fake.submitted.lock().unwrap().clone(),
            vec![(sent.session_id.to_string(), "users".to_string())]
        );

        let next = chat.send("and admins?", &cancel).await.unwrap();
        assert_ne!(next.session_id, sent.session_id);
        assert_eq!(
            fake.created_ids(),
            vec![sent.session_id.to_string(), next.session_id.to_string()]
        );
    }

    #[tokio::test]
    async fn test_status_for_current_session() {
        let fake = Arc::new(FakeBackend::with_script(vec![Note::new("done <taskcompleted/>")]));
        let mut chat = chat_against(fake).await;

        assert!(chat.status().await.unwrap().is_none());
        chat.send("hi", &CancellationToken::new()).await.unwrap();
        let status = chat.status().await.unwrap().unwrap();
        assert_eq!(status.current_agent, "orchestrator");
        assert!(status.is_active);
    }

    #[tokio::test]
    async fn test_dead_relay_leaves_inline_error() {
        let mut chat = ChatClient::new(
            RelayApiClient::new(reqwest::Client::new(), "http://127.0.0.1:1"),
            fast_polls(),
        );
        assert!(chat.send("hello", &CancellationToken::new()).await.is_err());
        let last = chat.transcript().last().unwrap();
        assert_eq!(last.status, EntryStatus::Error);
        assert!(chat.assistant_chunks().is_empty());
    }
}
