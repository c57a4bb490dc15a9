use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::limits::MAX_WAL_ENTRY_LEN;
use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on a clean or torn end of file.
fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only booking log, one file per site.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Replay keeps the longest prefix of whole, checksummed entries.
///
/// The file never holds bytes past `synced_len` that a caller was told are
/// durable: a failed batch is cut off again by `rollback`, and a WAL that
/// cannot be cut back refuses further appends.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    synced_len: u64,
    synced_appends: u64,
    poisoned: bool,
}

fn poisoned_err() -> io::Error {
    io::Error::other("WAL is poisoned after a failed rollback")
}

impl Wal {
    /// Open (or create) the WAL file at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            synced_appends: 0,
            poisoned: false,
        })
    }

    /// Replay the WAL and open it for appending. A torn or corrupt tail is
    /// cut off first so new entries land directly after the last valid one.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = read_valid_prefix(path)?;
        let mut wal = Self::open(path)?;
        if wal.synced_len > valid_len {
            warn!(
                "{}: truncating {} trailing bytes",
                path.display(),
                wal.synced_len - valid_len
            );
            wal.writer.get_ref().set_len(valid_len)?;
            wal.writer.get_ref().sync_all()?;
            wal.synced_len = valid_len;
        }
        Ok((wal, events))
    }

    /// Append one event and fsync. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event without flushing. Durable only after `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(poisoned_err());
        }
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(poisoned_err());
        }
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.synced_len = file.metadata()?.len();
        self.synced_appends = self.appends_since_compact;
        Ok(())
    }

    /// Throw away everything written or buffered since the last successful
    /// `flush_sync`. If the file cannot be cut back the WAL is poisoned.
    pub fn rollback(&mut self) {
        if self.poisoned {
            return;
        }
        if let Err(e) = self.truncate_to_synced() {
            warn!("{}: rollback failed, refusing further appends: {e}", self.path.display());
            self.poisoned = true;
        }
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts drops the buffered bytes instead of flushing them.
        let (_, _discarded) = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.synced_appends;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to a temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename the temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(poisoned_err());
        }
        self.writer.flush()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.synced_appends = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid events up to the first
    /// torn or corrupt entry. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_valid_prefix(path).map(|(events, _)| events)
    }
}

/// Decode whole entries until the first torn or corrupt one. Returns the
/// events and the byte length of the valid prefix.
fn read_valid_prefix(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        if !read_frame_part(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_WAL_ENTRY_LEN {
            warn!("{}: implausible entry length {len} after {} events, discarding tail", path.display(), events.len());
            break;
        }

        let mut payload = vec![0u8; len];
        if !read_frame_part(&mut reader, &mut payload)? {
            warn!("{}: torn entry after {} events, discarding tail", path.display(), events.len());
            break;
        }

        let mut crc_buf = [0u8; 4];
        if !read_frame_part(&mut reader, &mut crc_buf)? {
            warn!("{}: torn entry after {} events, discarding tail", path.display(), events.len());
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            warn!("{}: checksum mismatch after {} events, discarding tail", path.display(), events.len());
            break;
        }

        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!("{}: undecodable entry after {} events: {e}", path.display(), events.len());
                break;
            }
        }
        valid_len += 8 + len as u64;
    }

    Ok((events, valid_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::{NaiveDate, Weekday};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn sample_events() -> Vec<Event> {
        let rid = Ulid::new();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let slot = Slot::new(rid, date, Span::new(hm(9, 0), hm(9, 20)));
        let booking_id = Ulid::new();
        vec![
            Event::ResourceLoaded {
                resource: Resource::new(
                    rid,
                    Some("Dr. A".into()),
                    vec![WorkingWindow::new(Weekday::Mon, hm(9, 0), hm(10, 0), 20)],
                ),
            },
            Event::BookingReserved {
                booking: Booking {
                    id: booking_id,
                    slot,
                    requester: "alice".into(),
                    status: BookingStatus::Scheduled,
                    created_at: 1,
                    updated_at: 1,
                },
            },
            Event::BookingCancelled {
                id: booking_id,
                slot,
                requester: "alice".into(),
                by: "front-desk".into(),
                at: 2,
            },
            Event::RequesterCapSet {
                requester: "alice".into(),
                cap: 5,
            },
        ]
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = sample_events();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), events.len() as u64);
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn garbage_length_prefix_stops_replay() {
        let path = tmp_path("garbage_len.wal");
        let events = sample_events();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&events[0]).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        fs::write(&path, &bytes).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), events[..1].to_vec());
    }

    #[test]
    fn torn_tail_is_discarded() {
        let path = tmp_path("torn_tail.wal");
        let events = sample_events();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let full = fs::read(&path).unwrap();
        fs::write(&path, &full[..full.len() - 3]).unwrap();

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events[..events.len() - 1].to_vec());
    }

    #[test]
    fn corrupt_entry_stops_replay() {
        let path = tmp_path("corrupt_entry.wal");
        let events = sample_events();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let mut bytes = fs::read(&path).unwrap();
        // Flip a byte inside the first payload.
        bytes[6] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_replaces_contents() {
        let path = tmp_path("compact_replaces.wal");
        let events = sample_events();
        let mut wal = Wal::open(&path).unwrap();
        for e in &events {
            wal.append(e).unwrap();
        }

        wal.compact(&events[..1]).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert_eq!(Wal::replay(&path).unwrap(), events[..1].to_vec());

        // Appends after compaction land in the new file.
        wal.append(&events[3]).unwrap();
        assert_eq!(
            Wal::replay(&path).unwrap(),
            vec![events[0].clone(), events[3].clone()]
        );
    }

    #[test]
    fn rollback_drops_partial_batch() {
        let path = tmp_path("rollback_partial.wal");
        let events = sample_events();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&events[0]).unwrap();

        // A batch dies halfway: a torn frame reached the file, another
        // event is still buffered.
        wal.writer.write_all(&100u32.to_le_bytes()).unwrap();
        wal.writer.write_all(&[1, 2, 3]).unwrap();
        wal.writer.flush().unwrap();
        wal.append_buffered(&events[1]).unwrap();
        wal.rollback();
        assert_eq!(wal.appends_since_compact(), 1);

        // Later commits are not hidden behind the torn frame.
        wal.append(&events[2]).unwrap();
        wal.append(&events[3]).unwrap();
        drop(wal);

        assert_eq!(
            Wal::replay(&path).unwrap(),
            vec![events[0].clone(), events[2].clone(), events[3].clone()]
        );
    }

    #[test]
    fn recover_truncates_torn_tail() {
        let path = tmp_path("recover_torn.wal");
        let events = sample_events();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&events[0]).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let valid = bytes.len() as u64;
        bytes.extend_from_slice(&[9, 0, 0, 0, 7]);
        fs::write(&path, &bytes).unwrap();

        let (mut wal, replayed) = Wal::recover(&path).unwrap();
        assert_eq!(replayed, events[..1].to_vec());
        assert_eq!(fs::metadata(&path).unwrap().len(), valid);

        wal.append(&events[1]).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), events[..2].to_vec());
    }

    #[test]
    fn poisoned_wal_refuses_appends() {
        let path = tmp_path("poisoned.wal");
        let events = sample_events();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&events[0]).unwrap();
        wal.poisoned = true;

        assert!(wal.append(&events[1]).is_err());
        assert!(wal.flush_sync().is_err());
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), events[..1].to_vec());
    }
}
