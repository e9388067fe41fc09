//! User-registered event handlers.
//!
//! Each handler is invoked synchronously on the dispatcher worker inside a
//! panic boundary, so a failing handler loses only its own event.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::RoomId;
use crate::engine::EngineBuilder;
use crate::event::*;

/// A shared event callback.
pub type Handler<T> = Arc<dyn Fn(RoomId, T) + Send + Sync + 'static>;

macro_rules! event_handlers {
    ( $( $variant:ident($ty:ty) => $field:ident, $setter:ident; )+ ) => {
        /// Handler table, one optional slot per event type.
        #[derive(Clone, Default)]
        pub(crate) struct Handlers {
            $( pub(crate) $field: Option<Handler<$ty>>, )+
            pub(crate) popularity: Option<Handler<u32>>,
            pub(crate) raw: Option<Handler<RawCommand>>,
        }

        impl Handlers {
            /// Hand `event` to its handler, if one is registered.
            pub(crate) fn deliver(&self, room_id: RoomId, event: Event) {
                let kind = event.kind();
                match event {
                    $( Event::$variant(value) => invoke(kind, self.$field.as_ref(), room_id, value), )+
                }
            }

            pub(crate) fn registered(&self) -> Vec<&'static str> {
                let mut names = Vec::new();
                $( if self.$field.is_some() { names.push(stringify!($field)); } )+
                if self.popularity.is_some() { names.push("popularity"); }
                if self.raw.is_some() { names.push("raw"); }
                names
            }
        }

        impl EngineBuilder {
            $(
                pub fn $setter(mut self, handler: impl Fn(RoomId, $ty) + Send + Sync + 'static) -> Self {
                    self.handlers.$field = Some(Arc::new(handler));
                    self
                }
            )+

            /// Current popularity count, from heartbeat replies.
            pub fn on_popularity(mut self, handler: impl Fn(RoomId, u32) + Send + Sync + 'static) -> Self {
                self.handlers.popularity = Some(Arc::new(handler));
                self
            }

            /// Unknown and ignored commands, only called in debug mode.
            pub fn on_raw(mut self, handler: impl Fn(RoomId, RawCommand) + Send + Sync + 'static) -> Self {
                self.handlers.raw = Some(Arc::new(handler));
                self
            }
        }
    };
}

event_handlers! {
    Chat(ChatMessage) => chat, on_chat;
    Gift(GiftEvent) => gift, on_gift;
    ComboStart(ComboStart) => combo_start, on_combo_start;
    ComboEnd(ComboEnd) => combo_end, on_combo_end;
    GuardPurchase(GuardPurchase) => guard_purchase, on_guard_purchase;
    UserEnter(UserEnter) => user_enter, on_user_enter;
    GuardEnter(GuardEnter) => guard_enter, on_guard_enter;
    RoomChange(RoomChange) => room_change, on_room_change;
    FansUpdate(FansUpdate) => fans_update, on_fans_update;
    RankUpdate(RankUpdate) => rank_update, on_rank_update;
    Storm(StormLifecycle) => storm, on_storm;
    SuperChat(SuperChatMessage) => super_chat, on_super_chat;
    System(SystemMessage) => system, on_system;
    EntryEffect(EntryEffect) => entry_effect, on_entry_effect;
    InteractWord(InteractWord) => interact_word, on_interact_word;
    PkBattleStart(PkBattleStart) => pk_battle_start, on_pk_battle_start;
    PkBattleProcess(PkBattleProcess) => pk_battle_process, on_pk_battle_process;
    PkBattleEnd(PkBattleEnd) => pk_battle_end, on_pk_battle_end;
    LiveStart(LiveStart) => live_start, on_live_start;
    LiveEnd(LiveEnd) => live_end, on_live_end;
}

impl Handlers {
    pub(crate) fn popularity(&self, room_id: RoomId, count: u32) {
        invoke("popularity", self.popularity.as_ref(), room_id, count);
    }

    pub(crate) fn raw(&self, room_id: RoomId, command: RawCommand) {
        invoke("raw", self.raw.as_ref(), room_id, command);
    }
}

fn invoke<T>(kind: &'static str, handler: Option<&Handler<T>>, room_id: RoomId, value: T) {
    let Some(handler) = handler else {
        return;
    };
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(room_id, value))) {
        warn!(
            room_id,
            kind,
            panic = %panic_message(payload.as_ref()),
            "event handler panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "<non-string panic payload>".to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_deliver_routes_by_variant() {
        let chats = Arc::new(AtomicUsize::new(0));
        let counter = chats.clone();
        let mut handlers = Handlers::default();
        handlers.chat = Some(Arc::new(move |room_id: RoomId, msg: ChatMessage| {
            assert_eq!(room_id, 7);
            assert_eq!(msg.text, "hi");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        handlers.deliver(
            7,
            Event::Chat(ChatMessage {
                text: "hi".into(),
                ..Default::default()
            }),
        );
        handlers.deliver(7, Event::Gift(GiftEvent::default()));

        assert_eq!(chats.load(Ordering::SeqCst), 1);
        assert_eq!(handlers.registered(), vec!["chat"]);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut handlers = Handlers::default();
        handlers.popularity = Some(Arc::new(move |_: RoomId, count: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            if count == 0 {
                panic!("boom");
            }
        }));

        handlers.popularity(1, 0);
        handlers.popularity(1, 5);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("plain")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "plain");

        let payload = panic::catch_unwind(|| panic!("formatted {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 1");
    }
}
