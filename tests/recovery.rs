use sediment::{Database, DocInfo, Document, OpenOptions, SaveOptions};
use std::ops::ControlFlow;
use std::path::Path;
use test_log::test;

fn create(path: &Path) -> sediment::Result<Database> {
    Database::open(
        path,
        OpenOptions {
            create: true,
            ..Default::default()
        },
    )
}

fn save_one(db: &mut Database, id: &str, body: &str, rev: u64) -> sediment::Result<()> {
    let doc = Document::new(id, body);
    let mut info = DocInfo::new(id, rev);
    db.save_doc(&doc, &mut info, SaveOptions::default())
}

#[test]
fn crash_before_commit_falls_back_to_last_snapshot() -> sediment::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("crash.db");

    let mut db = create(&path)?;
    save_one(&mut db, "k", "v", 1)?;
    db.commit()?;

    let committed_size = std::fs::metadata(&path)?.len();

    // A second batch is appended but never committed
    save_one(&mut db, "k2", "v2", 1)?;
    save_one(&mut db, "k", "v-updated", 2)?;
    drop(db);

    // Uncommitted appends past the last header are ignored on reopen
    {
        let db = Database::open(&path, OpenOptions::default())?;
        assert_eq!(1, db.update_seq());
        assert_eq!(b"v", &*db.open_doc(b"k")?.body);
        assert!(matches!(
            db.open_doc(b"k2"),
            Err(sediment::Error::DocNotFound)
        ));
    }

    // The same holds when the crash truncated the appends away entirely
    let file = std::fs::OpenOptions::new().write(true).open(&path)?;
    file.set_len(committed_size)?;
    drop(file);

    let db = Database::open(&path, OpenOptions::default())?;
    assert_eq!(1, db.update_seq());
    assert_eq!(b"v", &*db.open_doc(b"k")?.body);
    Ok(())
}

#[test]
fn newest_header_wins_and_corruption_falls_back() -> sediment::Result<()> {
    use std::io::{Seek, SeekFrom, Write};

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("headers.db");

    let mut db = create(&path)?;
    save_one(&mut db, "k", "first", 1)?;
    db.commit()?;
    let h1 = db.header_position();

    // Plenty of data blocks between the two headers
    for i in 0..200u32 {
        save_one(&mut db, &format!("filler{i:04}"), &"x".repeat(100), 1)?;
    }
    save_one(&mut db, "k", "second", 2)?;
    db.commit()?;
    let h2 = db.header_position();
    assert!(h2 > h1);
    drop(db);

    // The newest header is authoritative
    {
        let db = Database::open(&path, OpenOptions::default())?;
        assert_eq!(h2, db.header_position());
        assert_eq!(b"second", &*db.open_doc(b"k")?.body);
    }

    // Corrupting the header payload breaks its checksum and falls back
    // to the previous snapshot
    {
        let mut file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(h2 + 9))?;
        file.write_all(&[0xA5])?;
    }

    let db = Database::open(&path, OpenOptions::default())?;
    assert_eq!(h1, db.header_position());
    assert_eq!(1, db.update_seq());
    assert_eq!(b"first", &*db.open_doc(b"k")?.body);
    Ok(())
}

#[test]
fn truncation_at_any_position_never_panics() -> sediment::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("full.db");

    let mut db = create(&path)?;
    for round in 0..3u32 {
        let mut docs = vec![];
        let mut infos = vec![];
        for i in 0..50u32 {
            let id = format!("doc{i:03}");
            docs.push(Document::new(id.as_str(), format!("round{round}")));
            infos.push(DocInfo::new(id.as_str(), u64::from(round) + 1));
        }
        db.save_docs(&docs, &mut infos, SaveOptions::default())?;
        db.commit()?;
    }
    drop(db);

    let image = std::fs::read(&path)?;
    let truncated_path = dir.path().join("truncated.db");

    // Sample positions densely enough to cross several block and chunk
    // boundaries, including both edges
    let mut positions = (0..image.len()).step_by(409).collect::<Vec<_>>();
    positions.push(0);
    positions.push(image.len());
    positions.push(image.len() - 1);

    for position in positions {
        std::fs::write(&truncated_path, &image[..position])?;

        match Database::open(&truncated_path, OpenOptions::default()) {
            Ok(db) => {
                // A found snapshot must be fully readable
                db.all_docs(None, &mut |info| {
                    if !info.deleted {
                        db.open_doc_with_docinfo(&info)?;
                    }
                    Ok(ControlFlow::Continue(()))
                })?;
            }
            Err(sediment::Error::NoHeader) => {}
            Err(e) => panic!("unexpected error at truncation {position}: {e}"),
        }
    }

    Ok(())
}

#[test]
fn reader_opened_after_commit_sees_that_snapshot() -> sediment::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("reader.db");

    let mut writer = create(&path)?;
    save_one(&mut writer, "a", "1", 1)?;
    writer.commit()?;

    // Reader pins the snapshot it found at open time
    let reader = Database::open(
        &path,
        OpenOptions {
            read_only: true,
            ..Default::default()
        },
    )?;

    // Writer moves on; both its writes and its commit stay invisible to
    // the existing reader handle
    save_one(&mut writer, "b", "2", 1)?;
    writer.commit()?;

    assert_eq!(1, reader.update_seq());
    assert!(matches!(
        reader.open_doc(b"b"),
        Err(sediment::Error::DocNotFound)
    ));
    assert_eq!(b"1", &*reader.open_doc(b"a")?.body);

    // A reader opened now sees the new snapshot
    let fresh = Database::open(&path, OpenOptions::default())?;
    assert_eq!(2, fresh.update_seq());
    assert_eq!(b"2", &*fresh.open_doc(b"b")?.body);
    Ok(())
}

#[test]
fn empty_created_file_reopens_cleanly() -> sediment::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("empty.db");

    {
        let db = create(&path)?;
        assert_eq!(0, db.update_seq());
        assert_eq!(0, db.doc_count()?);
    }

    let db = Database::open(&path, OpenOptions::default())?;
    assert_eq!(0, db.update_seq());
    assert!(matches!(
        db.open_doc(b"anything"),
        Err(sediment::Error::DocNotFound)
    ));
    Ok(())
}
