use pim_dav_sync::error::DavError;
use pim_dav_sync::webdav::parse_multistatus;

#[test]
fn parse_multistatus_extracts_flattened_properties() {
    let xml = r#"
<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:carddav">
  <D:response>
    <D:href>/dav/user01/</D:href>
    <D:propstat>
      <D:prop>
        <D:current-user-principal>
          <D:href>/principals/user01/</D:href>
        </D:current-user-principal>
        <D:resourcetype>
          <D:collection/>
          <C:addressbook/>
        </D:resourcetype>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/user01/card-1.vcf</D:href>
    <D:propstat>
      <D:prop>
        <D:getetag>"etag-123"</D:getetag>
        <D:resourcetype/>
        <C:address-data><![CDATA[BEGIN:VCARD
END:VCARD
]]></C:address-data>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>
"#;

    let status = parse_multistatus(xml).expect("multistatus parses");
    assert_eq!(status.responses.len(), 2);

    let collection = &status.responses[0];
    assert_eq!(collection.href, "/dav/user01/");
    assert_eq!(
        collection.prop("current-user-principal:href"),
        Some("/principals/user01/")
    );
    assert!(collection.has_prop("resourcetype:collection"));
    assert!(collection.has_prop("resourcetype:addressbook"));
    assert!(!collection.has_prop("resourcetype"));
    assert_eq!(collection.propstats[0].status, 200);

    let item = &status.responses[1];
    assert_eq!(item.prop("getetag"), Some("\"etag-123\""));
    // an empty resourcetype marks a plain item
    assert_eq!(item.prop("resourcetype"), Some(""));
    let data = item.prop("address-data").expect("address data present");
    assert!(data.contains("BEGIN:VCARD"));
}

#[test]
fn parse_multistatus_collapses_component_set_and_top_level_token() {
    let xml = r#"
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:sync-token>top-token</D:sync-token>
  <D:response>
    <D:href>/dav/user01/cal/</D:href>
    <D:propstat>
      <D:prop>
        <D:displayname>Work</D:displayname>
        <C:supported-calendar-component-set>
          <C:comp name="VEVENT"/>
          <C:comp name="VTODO"/>
        </C:supported-calendar-component-set>
        <D:sync-token>item-token</D:sync-token>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>
"#;

    let status = parse_multistatus(xml).expect("multistatus parses");
    assert_eq!(status.sync_token.as_deref(), Some("top-token"));

    let cal = &status.responses[0];
    assert_eq!(cal.prop("displayname"), Some("Work"));
    assert!(cal.has_prop("supported-calendar-component-set:comp:VEVENT"));
    assert!(cal.has_prop("supported-calendar-component-set:comp:VTODO"));
    assert_eq!(cal.prop("sync-token"), Some("item-token"));
}

#[test]
fn parse_multistatus_decodes_hrefs_twice() {
    // iCloud percent-encodes hrefs twice
    let xml = r#"
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/card%25201.vcf</D:href>
    <D:propstat>
      <D:prop><D:getetag>"e"</D:getetag></D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>
"#;
    let status = parse_multistatus(xml).expect("multistatus parses");
    assert_eq!(status.responses[0].href, "/dav/card 1.vcf");
}

#[test]
fn parse_multistatus_reports_statuses_and_errors() {
    let xml = r#"
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:carddav">
  <D:response>
    <D:href>/dav/gone.vcf</D:href>
    <D:status>HTTP/1.1 404 Not Found</D:status>
  </D:response>
  <D:response>
    <D:href>/dav/conflict.vcf</D:href>
    <D:error><C:no-uid-conflict/></D:error>
  </D:response>
</D:multistatus>
"#;

    let status = parse_multistatus(xml).expect("multistatus parses");
    assert_eq!(status.responses[0].status, Some(404));
    assert!(status.responses[1].has_error("no-uid-conflict"));
}

#[test]
fn parse_multistatus_accepts_foreign_prefixes() {
    let xml = r#"
<x:multistatus xmlns:x="DAV:" xmlns:y="urn:ietf:params:xml:ns:caldav">
  <x:response>
    <x:href>/c/</x:href>
    <x:propstat>
      <x:prop><y:calendar-data>BEGIN:VCALENDAR</y:calendar-data></x:prop>
      <x:status>HTTP/1.1 200 OK</x:status>
    </x:propstat>
  </x:response>
</x:multistatus>
"#;
    let status = parse_multistatus(xml).expect("multistatus parses");
    assert_eq!(
        status.responses[0].prop("calendar-data"),
        Some("BEGIN:VCALENDAR")
    );
}

#[test]
fn empty_body_is_malformed() {
    assert!(matches!(
        parse_multistatus(""),
        Err(DavError::MalformedXml(_))
    ));
}

#[test]
fn wrong_root_is_rejected() {
    assert!(matches!(
        parse_multistatus(r#"<D:propfind xmlns:D="DAV:"/>"#),
        Err(DavError::WrongRoot)
    ));
}

#[test]
fn multistatus_without_dav_namespace_is_rejected() {
    assert!(matches!(
        parse_multistatus(r#"<multistatus xmlns="urn:example"><response/></multistatus>"#),
        Err(DavError::MissingDavNamespace)
    ));
}

#[test]
fn unparseable_xml_is_malformed() {
    assert!(matches!(
        parse_multistatus(r#"<D:multistatus xmlns:D="DAV:"><D:resp"#),
        Err(DavError::MalformedXml(_))
    ));
}

#[test]
fn empty_property_leaves_map_to_empty_string() {
    let xml = r#"
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/x</D:href>
    <D:propstat>
      <D:prop><D:getetag></D:getetag></D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>
"#;
    let status = parse_multistatus(xml).expect("multistatus parses");
    assert_eq!(status.responses[0].prop("getetag"), Some(""));
}
