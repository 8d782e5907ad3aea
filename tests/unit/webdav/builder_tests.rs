use pim_dav_sync::webdav::{
    ClientConfig, WebDavClient, build_multiget_body, build_sync_collection_body, escape_xml,
};

#[test]
fn escape_xml_covers_reserved_characters() {
    assert_eq!(
        escape_xml(r#"<a & "b">'c'"#),
        "&lt;a &amp; &quot;b&quot;&gt;&apos;c&apos;"
    );
}

#[test]
fn multiget_body_lists_hrefs_in_order() {
    let body = build_multiget_body(
        "addressbook-multiget",
        "urn:ietf:params:xml:ns:carddav",
        "address-data",
        ["/a/1.vcf", "/a/2 & 3.vcf"],
    )
    .expect("body built");

    assert!(body.starts_with(r#"<C:addressbook-multiget"#));
    assert!(body.contains("<C:address-data/>"));
    let first = body.find("<D:href>/a/1.vcf</D:href>").expect("first href");
    let second = body
        .find("<D:href>/a/2 &amp; 3.vcf</D:href>")
        .expect("second href escaped");
    assert!(first < second);
}

#[test]
fn multiget_body_empty_input_yields_none() {
    let hrefs: Vec<String> = vec![];
    assert!(
        build_multiget_body(
            "calendar-multiget",
            "urn:ietf:params:xml:ns:caldav",
            "calendar-data",
            hrefs,
        )
        .is_none()
    );
}

#[test]
fn sync_collection_body_embeds_previous_token() {
    let body = build_sync_collection_body(Some("tok-1"));
    assert!(body.contains("<D:sync-token>tok-1</D:sync-token>"));
    assert!(body.contains("<D:sync-level>1</D:sync-level>"));

    let fresh = build_sync_collection_body(None);
    assert!(fresh.contains("<D:sync-token/>"));
}

#[tokio::test]
async fn build_uri_resolves_relative_and_absolute_paths() {
    let client = WebDavClient::new(ClientConfig::new("https://dav.example.com/base/"))
        .expect("client builds");

    assert_eq!(
        client.build_uri("cards/1.vcf").unwrap().to_string(),
        "https://dav.example.com/base/cards/1.vcf"
    );
    assert_eq!(
        client.build_uri("/other/2.vcf").unwrap().to_string(),
        "https://dav.example.com/other/2.vcf"
    );
    assert_eq!(
        client.build_uri("").unwrap().to_string(),
        "https://dav.example.com/base/"
    );
    assert_eq!(
        client
            .build_uri("https://elsewhere.example.org/x")
            .unwrap()
            .to_string(),
        "https://elsewhere.example.org/x"
    );
    assert_eq!(
        client.build_uri("q?depth=1").unwrap().to_string(),
        "https://dav.example.com/base/q?depth=1"
    );
}
