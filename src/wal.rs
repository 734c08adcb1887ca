use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read `buf.len()` bytes. `Ok(false)` means the log ended (cleanly or mid-record).
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact record and its encoded size, or `None` at the end of the
/// usable log.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    let size = (len_buf.len() + payload.len() + crc_buf.len()) as u64;
    Ok(bincode::deserialize::<Event>(&payload).ok().map(|event| (event, size)))
}

/// File length and append count at a batch boundary.
#[derive(Debug, Clone, Copy)]
pub struct WalMark {
    len: u64,
    appends_since_compact: u64,
}

/// Append-only log of booking events.
///
/// Record layout: `[u32: len][bincode: Event][u32: crc32]`, little endian,
/// `len` covering the payload only. A torn or corrupt record ends replay;
/// everything before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event. The engine batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event; durable only after the next `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Where the log stands now. Only meaningful with an empty buffer,
    /// i.e. between `flush_sync` calls.
    pub fn mark(&self) -> io::Result<WalMark> {
        Ok(WalMark {
            len: self.writer.get_ref().metadata()?.len(),
            appends_since_compact: self.appends_since_compact,
        })
    }

    /// Drop everything written or buffered since `mark`.
    pub fn rollback(&mut self, mark: WalMark) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the unwritten buffer instead of flushing it on drop
        let (_, _unwritten) = stale.into_parts();
        self.writer.get_ref().set_len(mark.len)?;
        self.writer.get_ref().sync_all()?;
        self.appends_since_compact = mark.appends_since_compact;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted log next to the live one and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path.with_extension("wal.tmp"))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
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

    /// All intact events in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay, then cut a torn or corrupt tail off the file so later
    /// appends land directly after the last intact record.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, intact_len) = Self::scan(path)?;
        let file_len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        if file_len > intact_len {
            tracing::warn!(
                path = %path.display(),
                discarded = file_len - intact_len,
                "truncating torn WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }

    /// Intact events plus the byte length they occupy.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut intact_len = 0;
        while let Some((event, size)) = read_record(&mut reader)? {
            events.push(event);
            intact_len += size;
        }
        Ok((events, intact_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(id: Ulid) -> Event {
        Event::BookingCreated {
            id,
            ticket: Ulid::new(),
            requester_id: Ulid::new(),
            requested_for_id: Ulid::new(),
            span: Span::new(1_000, 2_000),
            vehicle_id: Some(Ulid::new()),
            created_at: 500,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let id = Ulid::new();
        let events = vec![
            created(id),
            Event::BookingApproved {
                id,
                approved_by: Ulid::new(),
                at: 900,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_before_new_appends() {
        let path = tmp_path("recover_torn_tail.wal");
        let first = created(Ulid::new());
        let second = created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[40u8, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_leaves_clean_log_alone() {
        let path = tmp_path("recover_clean.wal");
        assert!(Wal::recover(&path).unwrap().is_empty());
        assert!(!path.exists());

        let event = created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        assert_eq!(Wal::recover(&path).unwrap(), vec![event]);
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_buffered_and_flushed_batch() {
        let path = tmp_path("rollback.wal");
        let kept = created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();

            let mark = wal.mark().unwrap();
            wal.append_buffered(&created(Ulid::new())).unwrap();
            wal.flush_sync().unwrap();
            wal.append_buffered(&created(Ulid::new())).unwrap();
            assert_eq!(wal.appends_since_compact(), 3);

            wal.rollback(mark).unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept.clone()]);

        let after = created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&after).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, after]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = created(Ulid::new());
        let bad = Event::DriverAssigned {
            id: Ulid::new(),
            driver_id: Ulid::new(),
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_then_append.wal");
        let id = Ulid::new();
        let snapshot = vec![created(id)];
        let later = Event::VehicleAssigned {
            id,
            vehicle_id: Ulid::new(),
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..20 {
                wal.append(&created(Ulid::new())).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot[0].clone(), later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_land_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| created(Ulid::new())).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
