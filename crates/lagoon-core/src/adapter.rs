//! Module: adapter
//! Responsibility: uniform promise/async-sequence view over the capability's
//! callback-style requests and cursors.
//! Does not own: scan semantics (cursor engine) or transaction policy (task).

use crate::{
    capability::{Cursor, CursorRow, OpenEvent, OpenRequest, Request},
    error::{ErrorOrigin, InternalError},
    value::Value,
};
use futures::{
    Stream,
    channel::{mpsc, oneshot},
    stream,
};
use std::rc::Rc;

/// Await one capability request, resolving on success or rejecting with
/// the request's error.
pub async fn request<T: 'static>(request: Rc<dyn Request<T>>) -> Result<T, InternalError> {
    let (tx, rx) = oneshot::channel();
    request.subscribe(Box::new(move |result| {
        let _ = tx.send(result);
    }));

    match rx.await {
        Ok(result) => result,
        Err(_) => Err(InternalError::store(
            ErrorOrigin::Adapter,
            "request was dropped without resolving",
        )),
    }
}

/// Turn an open handshake into an async event sequence.
pub fn open_events(open: &Rc<dyn OpenRequest>) -> mpsc::UnboundedReceiver<OpenEvent> {
    let (tx, rx) = mpsc::unbounded();
    open.subscribe(Box::new(move |event| {
        let _ = tx.unbounded_send(event);
    }));
    rx
}

///
/// CursorWalk
/// Lazy stepwise view over a capability cursor. Each `next` advances the
/// cursor by exactly one row; the walk terminates at exhaustion.
///

pub struct CursorWalk {
    cursor: Rc<dyn Cursor>,
}

impl CursorWalk {
    #[must_use]
    pub fn new(cursor: Rc<dyn Cursor>) -> Self {
        Self { cursor }
    }

    pub async fn next(&mut self) -> Result<Option<WalkRow>, InternalError> {
        let row = request(self.cursor.advance()).await?;
        Ok(row.map(|row| WalkRow {
            row,
            cursor: self.cursor.clone(),
        }))
    }
}

///
/// WalkRow
/// One yielded cursor row plus the handle needed to mutate it in place.
///

pub struct WalkRow {
    pub row: CursorRow,
    cursor: Rc<dyn Cursor>,
}

impl WalkRow {
    pub async fn delete(&self) -> Result<(), InternalError> {
        request(self.cursor.delete()).await
    }

    pub async fn update(&self, value: Value) -> Result<(), InternalError> {
        request(self.cursor.update(value)).await
    }
}

/// Wrap a cursor as a lazy async sequence of raw values.
///
/// Errors reject the currently awaited step and end the sequence.
pub fn as_async_sequence(
    cursor: Rc<dyn Cursor>,
) -> impl Stream<Item = Result<Value, InternalError>> {
    stream::unfold(Some(CursorWalk::new(cursor)), |state| async move {
        let mut walk = state?;
        match walk.next().await {
            Ok(Some(row)) => Some((Ok(row.row.value), Some(walk))),
            Ok(None) => None,
            Err(err) => Some((Err(err), None)),
        }
    })
}
