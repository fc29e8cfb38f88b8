//! Messaging between the network-facing collaborators and the storage
//! worker. All series state is confined to the worker thread; receivers
//! and readers only ever move [`Task`]s through the [`TaskQueue`].

use std::collections::VecDeque;
use std::io;
use std::sync::{Condvar, Mutex};

use crate::calendar::Aggr;
use crate::registry::Registry;

/// Runs on the worker with the raw payload and the series registry.
pub type WriteFn = Box<dyn FnOnce(&[u8], &mut Registry) -> io::Result<()> + Send>;
/// Turns the raw request carried by a [`ReadTask`] into query parameters.
pub type ParseFn = Box<dyn FnOnce(&mut ReadTask) -> io::Result<()> + Send>;
/// Hands the finished task back to the originating collaborator. Always
/// invoked, also when parsing or the query failed.
pub type RespondFn = Box<dyn FnOnce(ReadTask) + Send>;

pub enum Task {
    Stop,
    Write(WriteTask),
    Read(Box<ReadTask>),
}

pub struct WriteTask {
    pub payload: Vec<u8>,
    pub parse: WriteFn,
}

pub struct ReadTask {
    /// Raw request as received from the network, parsed on the worker.
    pub request: String,
    // request fields, filled by the parse callback
    pub start: u32,
    pub end: u32,
    pub names: Vec<String>,
    pub aggr: Option<Aggr>,
    // result fields, filled by the worker
    pub step: u32,
    pub times: Vec<u32>,
    /// Row-major values, one row of `times.len()` entries per name.
    pub values: Vec<f32>,
    /// Set when parsing or the query failed; the respond callback turns
    /// this into the protocol's failure reply.
    pub failed: bool,
    pub(crate) parse: Option<ParseFn>,
    pub(crate) respond: Option<RespondFn>,
}

impl ReadTask {
    pub fn new(request: String, parse: ParseFn, respond: RespondFn) -> ReadTask {
        ReadTask {
            request,
            start: 0,
            end: 0,
            names: Vec::new(),
            aggr: None,
            step: 0,
            times: Vec::new(),
            values: Vec::new(),
            failed: false,
            parse: Some(parse),
            respond: Some(respond),
        }
    }

    pub(crate) fn take_parse(&mut self) -> Option<ParseFn> {
        self.parse.take()
    }

    pub(crate) fn take_respond(&mut self) -> Option<RespondFn> {
        self.respond.take()
    }
}

/// FIFO queue with a blocking pop and a distinguished front insertion for
/// the stop sentinel. Tasks enqueued after the worker has observed a stop
/// are dropped with the queue, unexecuted.
#[derive(Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    cond: Condvar,
}

impl TaskQueue {
    pub fn new() -> TaskQueue {
        TaskQueue::default()
    }

    /// Appends at the tail and wakes one waiter.
    pub fn put(&self, task: Task) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push_back(task);
        self.cond.notify_one();
    }

    /// Prepends at the head, ahead of any queued work.
    pub fn put_front(&self, task: Task) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push_front(task);
        self.cond.notify_one();
    }

    /// Shorthand for jumping the queue with a stop sentinel.
    pub fn stop(&self) {
        self.put_front(Task::Stop);
    }

    /// Blocks until a task is available and removes the head.
    pub fn get(&self) -> Task {
        let mut tasks = self.tasks.lock().unwrap();
        loop {
            if let Some(task) = tasks.pop_front() {
                return task;
            }
            tasks = self.cond.wait(tasks).unwrap();
        }
    }

    /// Removes the head if the queue is non-empty.
    pub fn try_get(&self) -> Option<Task> {
        self.tasks.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }
}
