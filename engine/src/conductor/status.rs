//! Live status board
//!
//! In-process view of running tasks: status, the step in progress and a
//! bounded tail of human-readable log lines. The store remains the source of
//! truth; this only exists so `get_status` can show progress without a
//! database round trip. The newest `keep_finished` finished tasks keep their
//! entry so the log tail stays visible; older ones fall back to the store.

use sdk::types::{TaskStatus, TaskStatusView};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::watch;

struct Entry {
    status: TaskStatus,
    current_step: Option<(u32, String)>,
    log: VecDeque<String>,
    done: watch::Sender<bool>,
}

#[derive(Default)]
struct Board {
    entries: HashMap<String, Entry>,
    /// Finished task ids, oldest first
    finished: VecDeque<String>,
}

pub struct StatusBoard {
    board: Mutex<Board>,
    tail_lines: usize,
    keep_finished: usize,
}

impl StatusBoard {
    pub fn new(tail_lines: usize, keep_finished: usize) -> Self {
        Self {
            board: Mutex::new(Board::default()),
            tail_lines: tail_lines.max(1),
            keep_finished,
        }
    }

    fn with_board<T>(&self, f: impl FnOnce(&mut Board) -> T) -> T {
        let mut board = self.board.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut board)
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        self.with_board(|board| f(&mut board.entries))
    }

    /// Number of tasks currently on the board
    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim a task id for execution
    ///
    /// Returns false if the id already has an active execution.
    pub fn register(&self, task_id: &str, status: TaskStatus) -> bool {
        self.with_board(|board| {
            if let Some(entry) = board.entries.get(task_id) {
                if !entry.status.is_terminal() {
                    return false;
                }
                board.finished.retain(|id| id != task_id);
            }
            let (done, _) = watch::channel(false);
            board.entries.insert(
                task_id.to_string(),
                Entry {
                    status,
                    current_step: None,
                    log: VecDeque::new(),
                    done,
                },
            );
            true
        })
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.with_entries(|entries| {
            entries
                .get(task_id)
                .is_some_and(|e| !e.status.is_terminal())
        })
    }

    pub fn set_status(&self, task_id: &str, status: TaskStatus) {
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(task_id) {
                entry.status = status;
                if status.is_terminal() {
                    entry.current_step = None;
                }
            }
        })
    }

    pub fn set_current_step(&self, task_id: &str, step: Option<(u32, String)>) {
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(task_id) {
                entry.current_step = step;
            }
        })
    }

    /// Append a line to the task's log tail
    pub fn log(&self, task_id: &str, line: impl Into<String>) {
        let stamped = format!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), line.into());
        let tail_lines = self.tail_lines;
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(task_id) {
                entry.log.push_back(stamped);
                while entry.log.len() > tail_lines {
                    entry.log.pop_front();
                }
            }
        })
    }

    /// Mark the execution finished and wake waiters
    ///
    /// Evicts the oldest finished entries beyond `keep_finished`.
    pub fn finish(&self, task_id: &str, status: TaskStatus) {
        let keep_finished = self.keep_finished;
        self.with_board(|board| {
            let Some(entry) = board.entries.get_mut(task_id) else {
                return;
            };
            entry.status = status;
            entry.current_step = None;
            entry.done.send_replace(true);

            if !board.finished.iter().any(|id| id == task_id) {
                board.finished.push_back(task_id.to_string());
            }
            while board.finished.len() > keep_finished {
                let Some(oldest) = board.finished.pop_front() else {
                    break;
                };
                if board
                    .entries
                    .get(&oldest)
                    .is_some_and(|e| e.status.is_terminal())
                {
                    board.entries.remove(&oldest);
                }
            }
        })
    }

    /// Receiver that flips to true when the task finishes
    pub fn subscribe(&self, task_id: &str) -> Option<watch::Receiver<bool>> {
        self.with_entries(|entries| entries.get(task_id).map(|e| e.done.subscribe()))
    }

    pub fn view(&self, task_id: &str) -> Option<TaskStatusView> {
        self.with_entries(|entries| {
            entries.get(task_id).map(|entry| TaskStatusView {
                task_id: task_id.to_string(),
                status: entry.status,
                current_step: entry.current_step.clone(),
                log_tail: entry.log.iter().cloned().collect(),
            })
        })
    }
}
