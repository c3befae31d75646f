use pretty_assertions::assert_eq;

use crate::catalog::{DatabaseInfo, TableInfo};
use crate::fsname::{fs2obj, is_valid_object_name, obj2fs, parse_partitioned_file, partitioned_files};

#[test]
fn empty_names_are_rejected() {
    assert!(obj2fs("").is_err());
    assert!(fs2obj("").is_err());
    assert!(is_valid_object_name("").is_err());
}

#[test]
fn safe_names_pass_through() {
    let name = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_";
    assert_eq!(obj2fs(name).expect("encode"), name);
    assert_eq!(fs2obj(name).expect("decode"), name);
}

#[test]
fn every_special_character_is_escaped() {
    let name = r##" !"#$%&'()*+,-./:;<=>?@[\]^`{|}~"##;
    let expected = concat!(
        "@0020", "@0021", "@0022", "@0023", "@0024", "@0025", "@0026", "@0027",
        "@0028", "@0029", "@002a", "@002b", "@002c", "@002d", "@002e", "@002f",
        "@003a", "@003b", "@003c", "@003d", "@003e", "@003f", "@0040", "@005b",
        "@005c", "@005d", "@005e", "@0060", "@007b", "@007c", "@007d", "@007e",
    );
    assert_eq!(obj2fs(name).expect("encode"), expected);
    // Twice the input gives twice the output.
    let doubled = format!("{name}{name}");
    assert_eq!(obj2fs(&doubled).expect("encode"), format!("{expected}{expected}"));
}

#[test]
fn decoder_is_lenient_about_partial_escapes() {
    let encoded = "abcd@@002@0021@00222@00@0@@0026@0027123456789_@@007e";
    let expected = "abcd@@002!\"2@00@0@&'123456789_@~";
    assert_eq!(fs2obj(encoded).expect("decode"), expected);
}

#[test]
fn round_trip_restores_the_name() {
    for name in [
        r##" !"#$%&'()*+,-./:;<=>?@[\]^`{|}~"##,
        "abcd@@002!\"2@00@0@&'123456789_@~",
        "mixed Name-42",
        "ünïcode",
    ] {
        let encoded = obj2fs(name).expect("encode");
        assert!(encoded.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'@'));
        assert_eq!(fs2obj(&encoded).expect("decode"), name);
    }
}

#[test]
fn control_characters_are_not_valid_object_names() {
    assert!(is_valid_object_name("Object").expect("check"));
    assert!(is_valid_object_name(r##"we!rd"name"##).expect("check"));
    assert!(!is_valid_object_name("\t\n\r").expect("check"));
}

fn test_database() -> DatabaseInfo {
    DatabaseInfo {
        name: "db1".to_string(),
        tables: vec![
            TableInfo {
                name: "Object".to_string(),
                is_partitioned: true,
                ..TableInfo::default()
            },
            TableInfo {
                name: "Source".to_string(),
                is_partitioned: true,
                ..TableInfo::default()
            },
            TableInfo { name: "Filter".to_string(), ..TableInfo::default() },
        ],
    }
}

#[test]
fn partitioned_files_cover_base_and_overlap_tables() {
    let files = partitioned_files(&test_database(), 7);
    assert_eq!(
        files,
        vec![
            "Object_7.frm",
            "Object_7.MYD",
            "Object_7.MYI",
            "ObjectFullOverlap_7.frm",
            "ObjectFullOverlap_7.MYD",
            "ObjectFullOverlap_7.MYI",
            "Source_7.frm",
            "Source_7.MYD",
            "Source_7.MYI",
            "SourceFullOverlap_7.frm",
            "SourceFullOverlap_7.MYD",
            "SourceFullOverlap_7.MYI",
        ]
    );
}

#[test]
fn parser_accepts_exactly_the_generated_names() {
    let database = test_database();
    for (chunk, file) in [(0_u32, "Object_0.MYD"), (123, "SourceFullOverlap_123.frm")] {
        let (table, parsed_chunk, ext) =
            parse_partitioned_file(&database, file).expect("parse");
        assert_eq!(parsed_chunk, chunk);
        assert!(table == "Object" || table == "Source");
        assert!(["frm", "MYD", "MYI"].contains(&ext.as_str()));
    }
    // Every generated name parses back.
    for file in partitioned_files(&database, 42) {
        assert!(parse_partitioned_file(&database, &file).is_some(), "{file}");
    }
}

#[test]
fn parser_rejects_foreign_and_temporary_names() {
    let database = test_database();
    for file in [
        "Object_7",           // no extension
        "Object_7.dat",       // unknown extension
        "Object_x.MYD",       // non-numeric chunk
        "Object.MYD",         // no chunk
        "Filter_7.MYD",       // not a partitioned table
        "Unknown_7.MYD",      // unknown table
        "_Object_7.MYD",      // temporary file
        "ObjectOverlap_7.MYD" // wrong overlap suffix
    ] {
        assert!(parse_partitioned_file(&database, file).is_none(), "{file}");
    }
}
