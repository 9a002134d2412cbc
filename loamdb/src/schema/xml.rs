//! Schema document I/O: parse and serialize the XML schema format,
//! including extension documents that append to a previously parsed schema.

use crate::error::{LoamError, Result};
use crate::schema::types::{
    Annotation, Attribute, AttributeKind, Mixin, Schema, Type, UniqueConstraint,
};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;
use std::io::Cursor;

fn xml_err(e: impl std::fmt::Display) -> LoamError {
    LoamError::SchemaXml(e.to_string())
}

/// Parse a base schema document.
pub fn parse_schema(xml: &str) -> Result<Schema> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Decl(_) | Event::Comment(_) | Event::Text(_) | Event::PI(_) => {}
            Event::Start(e) if e.local_name().as_ref() == b"schema" => {
                let attrs = attr_map(&e)?;
                let mut schema = Schema::new(
                    required(&attrs, "name", "schema")?,
                    attrs.get("namespace").cloned().unwrap_or_default(),
                );
                parse_schema_body(&mut reader, &mut schema)?;
                return Ok(schema);
            }
            Event::Eof => {
                return Err(LoamError::SchemaXml(
                    "document has no <schema> root element".into(),
                ))
            }
            other => return Err(unexpected("schema document", &other)),
        }
    }
}

/// Parse an extension document against a previously parsed schema. New
/// types and mixins are appended; `<extend-type>`/`<extend-mixin>` append
/// attributes to existing definitions. Unresolved references fail before
/// the schema is touched further.
pub fn parse_extension(schema: &mut Schema, xml: &str) -> Result<()> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Decl(_) | Event::Comment(_) | Event::Text(_) | Event::PI(_) => {}
            Event::Start(e) if e.local_name().as_ref() == b"schema-extension" => {
                let attrs = attr_map(&e)?;
                let extends = required(&attrs, "extends", "schema-extension")?;
                if extends != schema.name {
                    return Err(LoamError::SchemaXml(format!(
                        "extension extends '{extends}' but the parsed schema is '{}'",
                        schema.name
                    )));
                }
                return parse_extension_body(&mut reader, schema);
            }
            Event::Eof => {
                return Err(LoamError::SchemaXml(
                    "document has no <schema-extension> root element".into(),
                ))
            }
            other => return Err(unexpected("extension document", &other)),
        }
    }
}

fn parse_schema_body(reader: &mut Reader<&[u8]>, schema: &mut Schema) -> Result<()> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Comment(_) | Event::Text(_) => {}
            Event::Empty(e) if e.local_name().as_ref() == b"annotation" => {
                schema.annotations.push(parse_annotation(&e)?);
            }
            Event::Start(e) if e.local_name().as_ref() == b"mixin" => {
                schema.mixins.push(parse_mixin(reader, &e)?);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"mixin" => {
                let attrs = attr_map(&e)?;
                schema.mixins.push(Mixin::new(required(&attrs, "name", "mixin")?));
            }
            Event::Start(e) if e.local_name().as_ref() == b"type" => {
                schema.types.push(parse_type(reader, &e)?);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"type" => {
                schema.types.push(type_header(&attr_map(&e)?)?);
            }
            Event::End(e) if e.local_name().as_ref() == b"schema" => return Ok(()),
            other => return Err(unexpected("<schema>", &other)),
        }
    }
}

fn parse_extension_body(reader: &mut Reader<&[u8]>, schema: &mut Schema) -> Result<()> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Comment(_) | Event::Text(_) => {}
            Event::Start(e) if e.local_name().as_ref() == b"mixin" => {
                let mixin = parse_mixin(reader, &e)?;
                if schema.mixin_by_name(&mixin.name).is_some() {
                    return Err(LoamError::SchemaXml(format!(
                        "extension redefines mixin '{}'",
                        mixin.name
                    )));
                }
                schema.mixins.push(mixin);
            }
            Event::Start(e) if e.local_name().as_ref() == b"type" => {
                let t = parse_type(reader, &e)?;
                if schema.type_by_name(&t.name).is_some() {
                    return Err(LoamError::SchemaXml(format!(
                        "extension redefines type '{}'",
                        t.name
                    )));
                }
                schema.types.push(t);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"type" => {
                let t = type_header(&attr_map(&e)?)?;
                if schema.type_by_name(&t.name).is_some() {
                    return Err(LoamError::SchemaXml(format!(
                        "extension redefines type '{}'",
                        t.name
                    )));
                }
                schema.types.push(t);
            }
            Event::Start(e) if e.local_name().as_ref() == b"extend-type" => {
                let attrs = attr_map(&e)?;
                let name = required(&attrs, "name", "extend-type")?;
                let extension = parse_type_body(reader, Type::new(name.clone()), b"extend-type")?;
                let target = schema
                    .types
                    .iter_mut()
                    .find(|t| t.name == name)
                    .ok_or_else(|| {
                        LoamError::SchemaXml(format!("extend-type references unknown type '{name}'"))
                    })?;
                target.attributes.extend(extension.attributes);
                target.mixins.extend(extension.mixins);
                target.unique_constraints.extend(extension.unique_constraints);
            }
            Event::Start(e) if e.local_name().as_ref() == b"extend-mixin" => {
                let attrs = attr_map(&e)?;
                let name = required(&attrs, "name", "extend-mixin")?;
                let extension = parse_mixin_body(reader, Mixin::new(name.clone()), b"extend-mixin")?;
                let target = schema
                    .mixins
                    .iter_mut()
                    .find(|m| m.name == name)
                    .ok_or_else(|| {
                        LoamError::SchemaXml(format!(
                            "extend-mixin references unknown mixin '{name}'"
                        ))
                    })?;
                target.attributes.extend(extension.attributes);
            }
            Event::End(e) if e.local_name().as_ref() == b"schema-extension" => return Ok(()),
            Event::Eof => {
                return Err(LoamError::SchemaXml(
                    "unterminated <schema-extension> element".into(),
                ))
            }
            other => return Err(unexpected("<schema-extension>", &other)),
        }
    }
}

fn type_header(attrs: &HashMap<String, String>) -> Result<Type> {
    let mut t = Type::new(required(attrs, "name", "type")?);
    t.parent = attrs.get("parent").cloned();
    t.is_abstract = flag(attrs, "abstract")?;
    Ok(t)
}

fn parse_type(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>) -> Result<Type> {
    let t = type_header(&attr_map(start)?)?;
    parse_type_body(reader, t, b"type")
}

fn parse_type_body(reader: &mut Reader<&[u8]>, mut t: Type, end_tag: &[u8]) -> Result<Type> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Comment(_) | Event::Text(_) => {}
            Event::Empty(e) if e.local_name().as_ref() == b"annotation" => {
                t.annotations.push(parse_annotation(&e)?);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"mixwith" => {
                let attrs = attr_map(&e)?;
                t.mixins.push(required(&attrs, "name", "mixwith")?);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"unique" => {
                let attrs = attr_map(&e)?;
                let names = required(&attrs, "attributes", "unique")?;
                t.unique_constraints.push(UniqueConstraint {
                    name: required(&attrs, "name", "unique")?,
                    attributes: names.split(',').map(|s| s.trim().to_string()).collect(),
                });
            }
            Event::Start(e) => {
                let tag = e.local_name().as_ref().to_vec();
                let attrs = attr_map(&e)?;
                t.attributes.push(parse_attribute(reader, &tag, &attrs, false)?);
            }
            Event::Empty(e) => {
                let tag = e.local_name().as_ref().to_vec();
                let attrs = attr_map(&e)?;
                t.attributes.push(parse_attribute(reader, &tag, &attrs, true)?);
            }
            Event::End(e) if e.local_name().as_ref() == end_tag => return Ok(t),
            other => return Err(unexpected("<type>", &other)),
        }
    }
}

fn parse_mixin(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>) -> Result<Mixin> {
    let attrs = attr_map(start)?;
    let m = Mixin::new(required(&attrs, "name", "mixin")?);
    parse_mixin_body(reader, m, b"mixin")
}

fn parse_mixin_body(reader: &mut Reader<&[u8]>, mut m: Mixin, end_tag: &[u8]) -> Result<Mixin> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Comment(_) | Event::Text(_) => {}
            Event::Empty(e) if e.local_name().as_ref() == b"annotation" => {
                m.annotations.push(parse_annotation(&e)?);
            }
            Event::Start(e) => {
                let tag = e.local_name().as_ref().to_vec();
                let attrs = attr_map(&e)?;
                m.attributes.push(parse_attribute(reader, &tag, &attrs, false)?);
            }
            Event::Empty(e) => {
                let tag = e.local_name().as_ref().to_vec();
                let attrs = attr_map(&e)?;
                m.attributes.push(parse_attribute(reader, &tag, &attrs, true)?);
            }
            Event::End(e) if e.local_name().as_ref() == end_tag => return Ok(m),
            other => return Err(unexpected("<mixin>", &other)),
        }
    }
}

fn parse_attribute(
    reader: &mut Reader<&[u8]>,
    tag: &[u8],
    attrs: &HashMap<String, String>,
    is_empty: bool,
) -> Result<Attribute> {
    let tag_str = String::from_utf8_lossy(tag).to_string();
    let kind = match tag {
        b"string" => AttributeKind::String {
            length: opt_u32(attrs, "length")?,
        },
        b"decimal" => AttributeKind::Decimal {
            precision: opt_u32(attrs, "precision")?,
            scale: opt_u32(attrs, "scale")?,
        },
        b"boolean" => AttributeKind::Boolean,
        b"date" => AttributeKind::Date,
        b"binary" => AttributeKind::Binary,
        b"json" => AttributeKind::Json,
        b"crypto" => AttributeKind::Crypto {
            length: opt_u32(attrs, "length")?,
        },
        b"typeref" => AttributeKind::TypeRef {
            target: required(attrs, "target", &tag_str)?,
        },
        b"mixinref" => AttributeKind::MixinRef {
            target: required(attrs, "target", &tag_str)?,
        },
        b"inverse" => AttributeKind::Inverse {
            referenced_type: required(attrs, "type", &tag_str)?,
            referencing_attribute: required(attrs, "attribute", &tag_str)?,
        },
        _ => {
            return Err(LoamError::SchemaXml(format!(
                "unknown attribute element <{tag_str}>"
            )))
        }
    };

    let mut attribute = Attribute::new(required(attrs, "name", &tag_str)?, kind);
    attribute.mandatory = flag(attrs, "mandatory")?;
    attribute.is_virtual = flag(attrs, "virtual")?;
    if matches!(attribute.kind, AttributeKind::Inverse { .. }) {
        attribute.is_virtual = true;
    }

    if !is_empty {
        // Only annotations may nest inside an attribute element.
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Comment(_) | Event::Text(_) => {}
                Event::Empty(e) if e.local_name().as_ref() == b"annotation" => {
                    attribute.annotations.push(parse_annotation(&e)?);
                }
                Event::End(e) if e.local_name().as_ref() == tag => break,
                other => return Err(unexpected(&format!("<{tag_str}>"), &other)),
            }
        }
    }
    Ok(attribute)
}

fn parse_annotation(e: &BytesStart<'_>) -> Result<Annotation> {
    let attrs = attr_map(e)?;
    Ok(Annotation {
        name: required(&attrs, "name", "annotation")?,
        value: attrs.get("value").cloned().unwrap_or_default(),
    })
}

fn attr_map(e: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value().map_err(xml_err)?.to_string();
        out.insert(key, value);
    }
    Ok(out)
}

fn required(attrs: &HashMap<String, String>, key: &str, element: &str) -> Result<String> {
    attrs.get(key).cloned().ok_or_else(|| {
        LoamError::SchemaXml(format!("<{element}> is missing required attribute '{key}'"))
    })
}

fn opt_u32(attrs: &HashMap<String, String>, key: &str) -> Result<Option<u32>> {
    match attrs.get(key) {
        None => Ok(None),
        Some(v) => v.parse::<u32>().map(Some).map_err(|_| {
            LoamError::SchemaXml(format!("attribute '{key}' is not a number: '{v}'"))
        }),
    }
}

fn flag(attrs: &HashMap<String, String>, key: &str) -> Result<bool> {
    match attrs.get(key).map(String::as_str) {
        None => Ok(false),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(LoamError::SchemaXml(format!(
            "attribute '{key}' expects true/false, got '{other}'"
        ))),
    }
}

fn unexpected(context: &str, event: &Event<'_>) -> LoamError {
    LoamError::SchemaXml(format!("unexpected content in {context}: {event:?}"))
}

// ── Serialization ────────────────────────────────────────────────

/// Serialize a schema back to its XML document form. Round-tripping the
/// output through `parse_schema` reproduces an equal schema.
pub fn serialize_schema(schema: &Schema) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let mut root = BytesStart::new("schema");
    root.push_attribute(("name", schema.name.as_str()));
    root.push_attribute(("namespace", schema.namespace.as_str()));
    writer.write_event(Event::Start(root)).map_err(xml_err)?;

    write_annotations(&mut writer, &schema.annotations)?;

    for mixin in &schema.mixins {
        let mut e = BytesStart::new("mixin");
        e.push_attribute(("name", mixin.name.as_str()));
        if mixin.attributes.is_empty() && mixin.annotations.is_empty() {
            writer.write_event(Event::Empty(e)).map_err(xml_err)?;
            continue;
        }
        writer.write_event(Event::Start(e)).map_err(xml_err)?;
        write_annotations(&mut writer, &mixin.annotations)?;
        for attr in &mixin.attributes {
            write_attribute(&mut writer, attr)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("mixin")))
            .map_err(xml_err)?;
    }

    for t in &schema.types {
        let mut e = BytesStart::new("type");
        e.push_attribute(("name", t.name.as_str()));
        if let Some(parent) = &t.parent {
            e.push_attribute(("parent", parent.as_str()));
        }
        if t.is_abstract {
            e.push_attribute(("abstract", "true"));
        }
        writer.write_event(Event::Start(e)).map_err(xml_err)?;
        write_annotations(&mut writer, &t.annotations)?;
        for mixin in &t.mixins {
            let mut m = BytesStart::new("mixwith");
            m.push_attribute(("name", mixin.as_str()));
            writer.write_event(Event::Empty(m)).map_err(xml_err)?;
        }
        for attr in &t.attributes {
            write_attribute(&mut writer, attr)?;
        }
        for c in &t.unique_constraints {
            let mut u = BytesStart::new("unique");
            u.push_attribute(("name", c.name.as_str()));
            u.push_attribute(("attributes", c.attributes.join(",").as_str()));
            writer.write_event(Event::Empty(u)).map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("type")))
            .map_err(xml_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("schema")))
        .map_err(xml_err)?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| LoamError::SchemaXml(e.to_string()))
}

fn write_attribute(writer: &mut Writer<Cursor<Vec<u8>>>, attr: &Attribute) -> Result<()> {
    let tag = attr.kind.keyword();
    let mut e = BytesStart::new(tag);
    e.push_attribute(("name", attr.name.as_str()));
    match &attr.kind {
        AttributeKind::String { length } | AttributeKind::Crypto { length } => {
            if let Some(l) = length {
                e.push_attribute(("length", l.to_string().as_str()));
            }
        }
        AttributeKind::Decimal { precision, scale } => {
            if let Some(p) = precision {
                e.push_attribute(("precision", p.to_string().as_str()));
            }
            if let Some(s) = scale {
                e.push_attribute(("scale", s.to_string().as_str()));
            }
        }
        AttributeKind::TypeRef { target } | AttributeKind::MixinRef { target } => {
            e.push_attribute(("target", target.as_str()));
        }
        AttributeKind::Inverse {
            referenced_type,
            referencing_attribute,
        } => {
            e.push_attribute(("type", referenced_type.as_str()));
            e.push_attribute(("attribute", referencing_attribute.as_str()));
        }
        _ => {}
    }
    if attr.mandatory {
        e.push_attribute(("mandatory", "true"));
    }
    // Inverse attributes are implicitly virtual; don't repeat the flag.
    if attr.is_virtual && !matches!(attr.kind, AttributeKind::Inverse { .. }) {
        e.push_attribute(("virtual", "true"));
    }

    if attr.annotations.is_empty() {
        writer.write_event(Event::Empty(e)).map_err(xml_err)?;
    } else {
        writer.write_event(Event::Start(e)).map_err(xml_err)?;
        write_annotations(writer, &attr.annotations)?;
        writer
            .write_event(Event::End(BytesEnd::new(tag)))
            .map_err(xml_err)?;
    }
    Ok(())
}

fn write_annotations(writer: &mut Writer<Cursor<Vec<u8>>>, annotations: &[Annotation]) -> Result<()> {
    for a in annotations {
        let mut e = BytesStart::new("annotation");
        e.push_attribute(("name", a.name.as_str()));
        e.push_attribute(("value", a.value.as_str()));
        writer.write_event(Event::Empty(e)).map_err(xml_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<schema name="sample" namespace="org.sample">
  <annotation name="owner" value="core-team"/>
  <mixin name="Mix">
    <string name="mixValue" length="64"/>
  </mixin>
  <type name="Base" abstract="true">
    <string name="baseValue"/>
  </type>
  <type name="Bar" parent="Base">
    <mixwith name="Mix"/>
    <string name="barValue" mandatory="true"/>
  </type>
  <type name="Baz" parent="Bar">
    <string name="bazValue"/>
  </type>
  <type name="Foo">
    <string name="value"/>
    <decimal name="amount" precision="10" scale="2"/>
    <boolean name="active"/>
    <date name="created"/>
    <binary name="payload"/>
    <json name="meta"/>
    <crypto name="secret" length="128"/>
    <typeref name="ref" target="Bar">
      <annotation name="on-delete" value="cascade"/>
    </typeref>
    <mixinref name="mref" target="Mix"/>
    <inverse name="bars" type="Bar" attribute="barValue"/>
    <unique name="foo_value" attributes="value"/>
  </type>
</schema>
"#;

    #[test]
    fn parses_sample_schema() {
        let schema = parse_schema(SAMPLE).unwrap();
        assert_eq!(schema.name, "sample");
        assert_eq!(schema.namespace, "org.sample");
        assert_eq!(schema.mixins.len(), 1);
        assert_eq!(schema.types.len(), 4);

        let foo = schema.type_by_name("Foo").unwrap();
        assert_eq!(foo.attributes.len(), 10);
        assert_eq!(foo.unique_constraints.len(), 1);
        assert_eq!(
            foo.attributes[7].kind,
            AttributeKind::TypeRef {
                target: "Bar".into()
            }
        );
        assert_eq!(foo.attributes[7].annotation("on-delete"), Some("cascade"));

        let bar = schema.type_by_name("Bar").unwrap();
        assert_eq!(bar.parent.as_deref(), Some("Base"));
        assert_eq!(bar.mixins, vec!["Mix".to_string()]);
        assert!(bar.attributes[0].mandatory);

        // Inverse attributes are always virtual.
        let inverse = &foo.attributes[9];
        assert!(inverse.is_virtual);
        assert!(!inverse.is_persisted());
    }

    #[test]
    fn round_trip_preserves_structure_and_order() {
        let schema = parse_schema(SAMPLE).unwrap();
        let xml = serialize_schema(&schema).unwrap();
        let reparsed = parse_schema(&xml).unwrap();
        assert_eq!(schema, reparsed);
    }

    #[test]
    fn missing_root_is_an_error() {
        let err = parse_schema("<types/>").unwrap_err();
        assert!(matches!(err, LoamError::SchemaXml(_)));
    }

    #[test]
    fn missing_required_attribute_is_an_error() {
        let err = parse_schema(r#"<schema name="s"><type><string name="x"/></type></schema>"#)
            .unwrap_err();
        assert!(err.to_string().contains("missing required attribute 'name'"));
    }

    #[test]
    fn unknown_attribute_element_is_an_error() {
        let err = parse_schema(
            r#"<schema name="s"><type name="T"><widget name="x"/></type></schema>"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown attribute element"));
    }

    #[test]
    fn extension_appends_types_and_attributes() {
        let mut schema = parse_schema(SAMPLE).unwrap();
        parse_extension(
            &mut schema,
            r#"
<schema-extension extends="sample">
  <type name="Extra">
    <string name="note"/>
  </type>
  <extend-type name="Foo">
    <string name="appended"/>
    <mixwith name="Mix"/>
  </extend-type>
  <extend-mixin name="Mix">
    <boolean name="mixFlag"/>
  </extend-mixin>
</schema-extension>
"#,
        )
        .unwrap();

        assert!(schema.type_by_name("Extra").is_some());
        let foo = schema.type_by_name("Foo").unwrap();
        assert_eq!(foo.attributes.last().unwrap().name, "appended");
        assert_eq!(foo.mixins, vec!["Mix".to_string()]);
        let mix = schema.mixin_by_name("Mix").unwrap();
        assert_eq!(mix.attributes.last().unwrap().name, "mixFlag");
    }

    #[test]
    fn extension_against_wrong_schema_fails() {
        let mut schema = parse_schema(SAMPLE).unwrap();
        let err = parse_extension(
            &mut schema,
            r#"<schema-extension extends="other"><type name="X"/></schema-extension>"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("extends 'other'"));
    }

    #[test]
    fn extension_with_unknown_target_fails() {
        let mut schema = parse_schema(SAMPLE).unwrap();
        let err = parse_extension(
            &mut schema,
            r#"<schema-extension extends="sample"><extend-type name="Nope"><string name="x"/></extend-type></schema-extension>"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown type 'Nope'"));
    }

    #[test]
    fn round_trip_after_extension() {
        let mut schema = parse_schema(SAMPLE).unwrap();
        parse_extension(
            &mut schema,
            r#"<schema-extension extends="sample"><extend-type name="Foo"><string name="extra"/></extend-type></schema-extension>"#,
        )
        .unwrap();
        let xml = serialize_schema(&schema).unwrap();
        let reparsed = parse_schema(&xml).unwrap();
        assert_eq!(schema, reparsed);
    }
}
