use crate::types::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Recording session that contains the original request and all chunks
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordingSession {
    /// The request body that was sent
    pub request: serde_json::Value,
    /// Timestamp of when the recording was started
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Data payloads as received from the API
    pub chunks: Vec<RecordedChunk>,
}

/// Single recorded chunk with timing info
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RecordedChunk {
    /// Raw content of the data part of the SSE line (or the whole body
    /// for non-streaming requests)
    pub data: String,
    /// Milliseconds since recording start
    pub timestamp_ms: u64,
}

struct ActiveRecording {
    session: RecordingSession,
    started: Instant,
}

/// Appends completed sessions to a JSON array on disk
#[derive(Clone)]
pub struct ApiRecorder {
    file_path: PathBuf,
    current: Arc<Mutex<Option<ActiveRecording>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ClientError::Config("recording state lock poisoned".to_string()))
}

impl ApiRecorder {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            file_path: path.as_ref().to_path_buf(),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a new recording session, discarding an unfinished one
    pub fn start_recording(&self, request: serde_json::Value) -> Result<()> {
        *lock(&self.current)? = Some(ActiveRecording {
            session: RecordingSession {
                request,
                timestamp: chrono::Utc::now(),
                chunks: Vec::new(),
            },
            started: Instant::now(),
        });
        Ok(())
    }

    pub fn record_chunk(&self, data: &str) -> Result<()> {
        if let Some(active) = lock(&self.current)?.as_mut() {
            let timestamp_ms = active.started.elapsed().as_millis() as u64;
            active.session.chunks.push(RecordedChunk {
                data: data.to_string(),
                timestamp_ms,
            });
        }
        Ok(())
    }

    /// Drop the current session without writing it
    pub fn discard_recording(&self) -> Result<()> {
        lock(&self.current)?.take();
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.current).is_ok_and(|current| current.is_some())
    }

    /// End the current recording session and save it to disk
    pub fn end_recording(&self) -> Result<()> {
        let Some(active) = lock(&self.current)?.take() else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(&active.session)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.file_path)?;

        let file_size = file.metadata()?.len();
        if file_size == 0 {
            writeln!(file, "[")?;
        } else {
            // Drop the trailing "\n]\n" and continue the array
            file.set_len(file_size.saturating_sub(3))?;
            file.seek(std::io::SeekFrom::End(0))?;
            writeln!(file, ",")?;
        }
        writeln!(file, "{json}")?;
        writeln!(file, "]")?;

        Ok(())
    }
}

/// Sessions loaded from a recording file, handed out in order
#[derive(Clone)]
pub struct PlaybackState {
    sessions: Arc<Vec<RecordingSession>>,
    index: Arc<Mutex<usize>>,
    pub fast: bool,
}

impl PlaybackState {
    pub fn from_file<P: AsRef<Path>>(path: P, fast: bool) -> Result<Self> {
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        let sessions: Vec<RecordingSession> = serde_json::from_str(&contents)?;
        Ok(Self::from_sessions(sessions, fast))
    }

    pub fn from_sessions(sessions: Vec<RecordingSession>, fast: bool) -> Self {
        Self {
            sessions: Arc::new(sessions),
            index: Arc::new(Mutex::new(0)),
            fast,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Take the next session, or None if exhausted
    pub fn next_session(&self) -> Result<Option<RecordingSession>> {
        let mut idx = lock(&self.index)?;
        let session = self.sessions.get(*idx).cloned();
        if session.is_some() {
            *idx += 1;
        }
        Ok(session)
    }
}
