use super::*;
use crate::test_support::{group_chat, message, user_chat, FakeChatApi};

fn chats() -> ActiveChatsResponse {
    ActiveChatsResponse {
        users: vec![user_chat("bob", 3), user_chat("carol", 1)],
        groups: vec![group_chat(42, "Team", 5)],
    }
}

#[test]
fn summaries_flatten_users_then_groups() {
    let mut reconciler = ChatStateReconciler::new();
    assert!(reconciler.apply_summaries(1, chats()));

    let summaries = reconciler.summaries();
    assert_eq!(summaries.len(), 3);
    assert_eq!(summaries[0].chat_ref(), ChatRef::user("bob"));
    assert_eq!(summaries[0].display_name, "bob name");
    assert_eq!(summaries[2].kind, ChatKind::Group);
    assert_eq!(summaries[2].target, uuid::Uuid::from_u128(42).to_string());
    assert_eq!(summaries[2].unread_count, 5);
}

#[test]
fn opening_a_chat_zeroes_unread_before_any_fetch() {
    let mut reconciler = ChatStateReconciler::new();
    reconciler.apply_summaries(1, chats());

    let refreshes = reconciler.open_chat(ChatRef::user("bob"));
    assert_eq!(
        refreshes,
        vec![Refresh::Messages(ChatRef::user("bob")), Refresh::Summaries]
    );
    assert_eq!(reconciler.summary(&ChatRef::user("bob")).map(|s| s.unread_count), Some(0));
    assert_eq!(reconciler.summary(&ChatRef::user("carol")).map(|s| s.unread_count), Some(1));
    assert_eq!(reconciler.active_chat(), Some(&ChatRef::user("bob")));
}

#[test]
fn open_chat_stays_read_when_server_counts_lag() {
    let mut reconciler = ChatStateReconciler::new();
    reconciler.open_chat(ChatRef::user("bob"));

    assert!(reconciler.apply_summaries(1, chats()));
    assert_eq!(reconciler.summary(&ChatRef::user("bob")).map(|s| s.unread_count), Some(0));
    assert_eq!(reconciler.summary(&ChatRef::user("carol")).map(|s| s.unread_count), Some(1));
}

#[test]
fn stale_fetches_are_discarded() {
    let mut reconciler = ChatStateReconciler::new();
    let bob = ChatRef::user("bob");
    reconciler.open_chat(bob.clone());

    assert!(reconciler.apply_messages(&bob, 4, vec![message(1, "a"), message(2, "b")]));
    assert!(!reconciler.apply_messages(&bob, 3, vec![message(1, "a")]));
    assert_eq!(reconciler.timeline().len(), 2);

    assert!(reconciler.apply_summaries(7, chats()));
    assert!(!reconciler.apply_summaries(6, ActiveChatsResponse::default()));
    assert_eq!(reconciler.summaries().len(), 3);
}

#[test]
fn messages_for_a_closed_chat_are_ignored() {
    let mut reconciler = ChatStateReconciler::new();
    reconciler.open_chat(ChatRef::user("bob"));
    reconciler.apply_messages(&ChatRef::user("bob"), 1, vec![message(1, "for bob")]);

    reconciler.open_chat(ChatRef::user("carol"));
    assert!(reconciler.timeline().is_empty());
    assert!(!reconciler.apply_messages(&ChatRef::user("bob"), 2, vec![message(1, "late")]));
    assert!(reconciler.apply_messages(&ChatRef::user("carol"), 3, vec![message(3, "hi")]));
}

#[test]
fn pushed_events_request_refreshes() {
    let mut reconciler = ChatStateReconciler::new();
    let update = ServerEvent::ChatUpdate {
        chat_type: None,
        target: None,
    };
    assert_eq!(reconciler.on_pushed_event(&update), vec![Refresh::Summaries]);

    reconciler.apply_summaries(1, chats());
    reconciler.open_chat(ChatRef::user("carol"));
    let new_message = ServerEvent::MessageNew {
        chat_type: ChatKind::User,
        target: "bob".into(),
        sender_login: "bob".into(),
        sender_name: "Bob".into(),
        preview: "yo".into(),
    };
    assert_eq!(
        reconciler.on_pushed_event(&new_message),
        vec![Refresh::Summaries, Refresh::Messages(ChatRef::user("carol"))]
    );

    let invite = ServerEvent::CallInvite {
        from_login: "bob".into(),
        from_name: "Bob".into(),
    };
    assert!(reconciler.on_pushed_event(&invite).is_empty());
}

#[tokio::test]
async fn fetcher_takes_increasing_tickets() {
    let api = FakeChatApi::new();
    api.set_chats(chats());
    api.set_messages(ChatRef::user("bob"), vec![message(1, "hi")]);
    let tickets = FetchTickets::new();
    let fetcher = RefreshFetcher::new(api.clone(), Credential::new("tok"), tickets.clone());

    let first = fetcher.fetch(Refresh::Summaries).await;
    let second = fetcher.fetch(Refresh::Messages(ChatRef::user("bob"))).await;
    let missing = fetcher.fetch(Refresh::Messages(ChatRef::user("ghost"))).await;

    assert!(matches!(first, FetchOutcome::Summaries { ticket: 1, result: Ok(_) }));
    assert!(matches!(
        second,
        FetchOutcome::Messages { ticket: 2, result: Ok(ref messages), .. } if messages.len() == 1
    ));
    assert!(matches!(
        missing,
        FetchOutcome::Messages { ticket: 3, result: Err(ref err), .. } if err.is_not_found()
    ));
    assert_eq!(tickets.latest(), 3);
}
