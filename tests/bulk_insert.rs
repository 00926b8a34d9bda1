use sediment::{Database, DocInfo, Document, OpenOptions, SaveOptions};
use std::ops::ControlFlow;
use test_log::test;

const DOC_COUNT: u32 = 10_000;

fn make_batch() -> (Vec<Document>, Vec<DocInfo>) {
    let mut docs = vec![];
    let mut infos = vec![];

    for i in 0..DOC_COUNT {
        let id = format!("k{i:06}");
        docs.push(Document::new(id.as_str(), id.as_str()));
        infos.push(DocInfo::new(id.as_str(), 1));
    }

    (docs, infos)
}

#[test]
fn bulk_insert_ten_thousand_docs() -> sediment::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("bulk.db");

    let mut db = Database::open(
        &path,
        OpenOptions {
            create: true,
            ..Default::default()
        },
    )?;

    let (docs, mut infos) = make_batch();
    db.save_docs(&docs, &mut infos, SaveOptions::default())?;
    db.commit()?;

    assert_eq!(u64::from(DOC_COUNT), db.update_seq());
    assert_eq!(u64::from(DOC_COUNT), db.doc_count()?);

    // all_docs enumerates every id in byte-lexicographic order
    let mut count = 0u32;
    db.all_docs(None, &mut |info| {
        assert_eq!(format!("k{count:06}").as_bytes(), &*info.id);
        count += 1;
        Ok(ControlFlow::Continue(()))
    })?;
    assert_eq!(DOC_COUNT, count);

    // The by-seq fold enumerates them in insertion order
    let mut seq = 0u64;
    db.changes_since(0, &mut |info| {
        seq += 1;
        assert_eq!(seq, info.db_seq);
        assert_eq!(format!("k{:06}", seq - 1).as_bytes(), &*info.id);
        Ok(ControlFlow::Continue(()))
    })?;
    assert_eq!(u64::from(DOC_COUNT), seq);

    // Point reads hit across the whole range
    assert_eq!(b"k000000", &*db.open_doc(b"k000000")?.body);
    assert_eq!(b"k004999", &*db.open_doc(b"k004999")?.body);
    assert_eq!(b"k009999", &*db.open_doc(b"k009999")?.body);

    // Scans can start mid-range
    let mut from_middle = 0u32;
    db.all_docs(Some(b"k009990"), &mut |_| {
        from_middle += 1;
        Ok(ControlFlow::Continue(()))
    })?;
    assert_eq!(10, from_middle);

    Ok(())
}

#[test]
fn bulk_insert_survives_reopen() -> sediment::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("bulk-reopen.db");

    {
        let mut db = Database::open(
            &path,
            OpenOptions {
                create: true,
                ..Default::default()
            },
        )?;
        let (docs, mut infos) = make_batch();
        db.save_docs(&docs, &mut infos, SaveOptions::default())?;
        db.commit()?;
    }

    let db = Database::open(&path, OpenOptions::default())?;
    assert_eq!(u64::from(DOC_COUNT), db.doc_count()?);
    assert_eq!(b"k007777", &*db.open_doc(b"k007777")?.body);
    Ok(())
}
