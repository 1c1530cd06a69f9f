//! GraphQL subscriptions backed by the subscription manager
//!
//! Each field opens one managed subscription whose transport is the channel
//! feeding the returned stream. Closing the WebSocket (or completing the
//! operation) drops the stream, which unsubscribes. A forced close such as a
//! queue overflow arrives as a final error item carrying its `code`.

use std::pin::Pin;
use std::sync::Arc;

use async_graphql::{Context, ErrorExtensions, ID, Result, Subscription};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::db::{CommentRecord, PostRecord, UserRecord};
use crate::services::events::{Event, topics};
use crate::services::subscriptions::{SubscribeRequest, SubscriptionManager, TransformError};
use crate::services::ContextFactory;

use super::helpers::bad_input;
use super::types::{Comment, DeliveryPolicy, EventMessage, Post, User};

const MAX_QUEUE_CAPACITY: i32 = 10_000;

type EventStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

/// Decode an event payload into a storage record
fn decode<T: DeserializeOwned>(event: &Event) -> Result<T, TransformError> {
    Ok(<T as Deserialize>::deserialize(event.payload.as_ref())?)
}

/// Keep only `fields` of an object payload; everything when `fields` is `None`
pub(crate) fn project(payload: &serde_json::Value, fields: Option<&[String]>) -> Result<serde_json::Value, TransformError> {
    let Some(fields) = fields else {
        return Ok(payload.clone());
    };
    let object = payload
        .as_object()
        .ok_or_else(|| TransformError("payload is not an object".to_string()))?;
    Ok(serde_json::Value::Object(
        fields
            .iter()
            .filter_map(|field| object.get(field).map(|value| (field.clone(), value.clone())))
            .collect(),
    ))
}

/// Open a managed subscription and shape every item with `wrap`.
fn open<S, T, W>(ctx: &Context<'_>, request: SubscribeRequest<S>, wrap: W) -> Result<EventStream<T>>
where
    S: Send + 'static,
    T: Send + 'static,
    W: Fn(S) -> T + Send + 'static,
{
    let manager = ctx.data::<Arc<SubscriptionManager>>()?;
    let stream = manager.subscribe_stream(request, 1);
    Ok(Box::pin(stream.map(move |item| item.map(&wrap).map_err(|e| e.extend()))))
}

#[derive(Default)]
pub struct SubscriptionRoot;

#[Subscription]
impl SubscriptionRoot {
    /// New comments on a post
    async fn comment_added(&self, ctx: &Context<'_>, post_id: ID) -> Result<EventStream<Comment>> {
        let contexts = ctx.data::<ContextFactory>()?.clone();
        open(
            ctx,
            SubscribeRequest::new(topics::comments_on_post(&post_id), decode::<CommentRecord>),
            move |record| Comment::scoped(record, Some(contexts.create())),
        )
    }

    /// Latest state of a post after each edit
    async fn post_updated(&self, ctx: &Context<'_>, post_id: ID) -> Result<EventStream<Post>> {
        let contexts = ctx.data::<ContextFactory>()?.clone();
        open(
            ctx,
            SubscribeRequest::new(topics::post_updated(&post_id), decode::<PostRecord>),
            move |record| Post::scoped(record, Some(contexts.create())),
        )
    }

    /// Latest state of a user's profile after each edit
    async fn user_updated(&self, ctx: &Context<'_>, user_id: ID) -> Result<EventStream<User>> {
        let contexts = ctx.data::<ContextFactory>()?.clone();
        open(
            ctx,
            SubscribeRequest::new(topics::user_updated(&user_id), decode::<UserRecord>),
            move |record| User::scoped(record, Some(contexts.create())),
        )
    }

    /// Raw events on a topic pattern: an exact topic, `prefix*`, or `*`.
    ///
    /// `fields` narrows object payloads to those keys. `policy` and `capacity`
    /// override the defaults for the topic family.
    async fn events(
        &self,
        ctx: &Context<'_>,
        topic: String,
        fields: Option<Vec<String>>,
        policy: Option<DeliveryPolicy>,
        capacity: Option<i32>,
    ) -> Result<EventStream<EventMessage>> {
        if topic.trim().is_empty() {
            return Err(bad_input("topic must not be empty"));
        }
        let capacity = match capacity {
            Some(c) if !(1..=MAX_QUEUE_CAPACITY).contains(&c) => {
                return Err(bad_input(format!("capacity must be between 1 and {MAX_QUEUE_CAPACITY}")));
            }
            Some(c) => Some(c as usize),
            None => None,
        };

        let request = SubscribeRequest::new(topic, move |event: &Event| {
            let payload = project(&event.payload, fields.as_deref())?;
            Ok(EventMessage::from_event(event, payload))
        })
        .policy(policy.map(Into::into))
        .capacity(capacity);

        open(ctx, request, |message| message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_project_keeps_requested_fields() {
        let payload = json!({ "id": 7, "text": "hi", "authorId": "u1" });
        let fields = vec!["id".to_string(), "text".to_string(), "missing".to_string()];
        assert_eq!(
            project(&payload, Some(fields.as_slice())).unwrap(),
            json!({ "id": 7, "text": "hi" })
        );
        assert_eq!(project(&payload, None).unwrap(), payload);
    }

    #[test]
    fn test_project_rejects_scalar_payload() {
        let fields = vec!["id".to_string()];
        assert!(project(&json!(42), Some(fields.as_slice())).is_err());
    }
}
