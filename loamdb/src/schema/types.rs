use crate::error::{LoamError, Result};
use serde::Serialize;

/// A free-form name/value pair attached to schemas, types, mixins and
/// attributes. Carried verbatim through document round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub name: String,
    pub value: String,
}

/// Kind-specific shape of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AttributeKind {
    String {
        length: Option<u32>,
    },
    Decimal {
        precision: Option<u32>,
        scale: Option<u32>,
    },
    Boolean,
    Date,
    Binary,
    Json,
    /// Encrypted scalar. Stored as ciphertext, plaintext in memory.
    Crypto {
        length: Option<u32>,
    },
    /// Single reference to a record of the target type (or a subtype).
    TypeRef {
        target: String,
    },
    /// Single reference to a record of any type composing the target mixin.
    MixinRef {
        target: String,
    },
    /// Computed back-reference: all records of `referenced_type` whose
    /// `referencing_attribute` points at the owning record. Never persisted.
    Inverse {
        referenced_type: String,
        referencing_attribute: String,
    },
}

impl AttributeKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            AttributeKind::String { .. } => "string",
            AttributeKind::Decimal { .. } => "decimal",
            AttributeKind::Boolean => "boolean",
            AttributeKind::Date => "date",
            AttributeKind::Binary => "binary",
            AttributeKind::Json => "json",
            AttributeKind::Crypto { .. } => "crypto",
            AttributeKind::TypeRef { .. } => "typeref",
            AttributeKind::MixinRef { .. } => "mixinref",
            AttributeKind::Inverse { .. } => "inverse",
        }
    }
}

/// A typed, named field definition on a Type or Mixin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
    pub name: String,
    pub kind: AttributeKind,
    pub mandatory: bool,
    /// Virtual attributes are derived at read time and never stored.
    pub is_virtual: bool,
    pub annotations: Vec<Annotation>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Attribute {
            name: name.into(),
            kind,
            mandatory: false,
            is_virtual: false,
            annotations: Vec::new(),
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn virtual_attr(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    pub fn annotate(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.push(Annotation {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Whether this attribute is backed by storage at all. Inverse
    /// attributes are resolved by reverse lookup and own no column.
    pub fn is_persisted(&self) -> bool {
        !self.is_virtual && !matches!(self.kind, AttributeKind::Inverse { .. })
    }

    pub fn is_reference(&self) -> bool {
        matches!(
            self.kind,
            AttributeKind::TypeRef { .. } | AttributeKind::MixinRef { .. }
        )
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.annotations
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }
}

/// A uniqueness guarantee over a set of attributes of one Type, enforced
/// across the type's whole concrete hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub attributes: Vec<String>,
}

/// A named entity definition with attributes, optional single parent and a
/// set of composed mixins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Type {
    pub name: String,
    pub parent: Option<String>,
    pub is_abstract: bool,
    pub attributes: Vec<Attribute>,
    /// Names of mixins this type composes ("mix with").
    pub mixins: Vec<String>,
    pub unique_constraints: Vec<UniqueConstraint>,
    pub annotations: Vec<Annotation>,
}

impl Type {
    pub fn new(name: impl Into<String>) -> Self {
        Type {
            name: name.into(),
            parent: None,
            is_abstract: false,
            attributes: Vec::new(),
            mixins: Vec::new(),
            unique_constraints: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn attribute(mut self, attr: Attribute) -> Self {
        self.attributes.push(attr);
        self
    }

    pub fn mix_with(mut self, mixin: impl Into<String>) -> Self {
        self.mixins.push(mixin.into());
        self
    }

    pub fn unique(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints.push(constraint);
        self
    }
}

/// A named, reusable attribute bundle composable into multiple types.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mixin {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub annotations: Vec<Annotation>,
}

impl Mixin {
    pub fn new(name: impl Into<String>) -> Self {
        Mixin {
            name: name.into(),
            attributes: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn attribute(mut self, attr: Attribute) -> Self {
        self.attributes.push(attr);
        self
    }
}

/// Either side of the type/mixin split, for contexts that accept both
/// (join-table owners, attribute lookups).
#[derive(Debug, Clone, Copy)]
pub enum AttributeHolder<'a> {
    Type(&'a Type),
    Mixin(&'a Mixin),
}

impl<'a> AttributeHolder<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            AttributeHolder::Type(t) => &t.name,
            AttributeHolder::Mixin(m) => &m.name,
        }
    }

    pub fn attributes(&self) -> &'a [Attribute] {
        match self {
            AttributeHolder::Type(t) => &t.attributes,
            AttributeHolder::Mixin(m) => &m.attributes,
        }
    }
}

/// The immutable-after-deployment description of a domain: an ordered list
/// of types and mixins under one namespace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schema {
    pub name: String,
    pub namespace: String,
    pub types: Vec<Type>,
    pub mixins: Vec<Mixin>,
    pub annotations: Vec<Annotation>,
}

impl Schema {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Schema {
            name: name.into(),
            namespace: namespace.into(),
            types: Vec::new(),
            mixins: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn with_type(mut self, t: Type) -> Self {
        self.types.push(t);
        self
    }

    pub fn with_mixin(mut self, m: Mixin) -> Self {
        self.mixins.push(m);
        self
    }

    pub fn type_by_name(&self, name: &str) -> Option<&Type> {
        self.types.iter().find(|t| t.name == name)
    }

    pub fn mixin_by_name(&self, name: &str) -> Option<&Mixin> {
        self.mixins.iter().find(|m| m.name == name)
    }

    fn type_or_err(&self, name: &str) -> Result<&Type> {
        self.type_by_name(name)
            .ok_or_else(|| LoamError::Schema(format!("Unknown type '{name}'")))
    }

    /// Parent chain of a type, nearest first, excluding the type itself.
    pub fn ancestors(&self, type_name: &str) -> Result<Vec<&Type>> {
        let mut chain = Vec::new();
        let mut current = self.type_or_err(type_name)?;
        while let Some(parent_name) = &current.parent {
            let parent = self.type_or_err(parent_name)?;
            // A cycle in the parent chain would loop forever.
            if chain.iter().any(|t: &&Type| t.name == parent.name) || parent.name == type_name {
                return Err(LoamError::Schema(format!(
                    "Inheritance cycle through type '{}'",
                    parent.name
                )));
            }
            chain.push(parent);
            current = parent;
        }
        Ok(chain)
    }

    /// Whether `sub` equals `sup` or inherits from it, transitively.
    pub fn is_subtype_of(&self, sub: &str, sup: &str) -> bool {
        if sub == sup {
            return true;
        }
        match self.ancestors(sub) {
            Ok(chain) => chain.iter().any(|t| t.name == sup),
            Err(_) => false,
        }
    }

    /// All mixin names effective on a type: its own plus every ancestor's,
    /// in root-first declaration order, without duplicates.
    pub fn effective_mixins(&self, type_name: &str) -> Result<Vec<&Mixin>> {
        let t = self.type_or_err(type_name)?;
        let mut names: Vec<&str> = Vec::new();
        let mut chain = self.ancestors(type_name)?;
        chain.reverse();
        chain.push(t);
        for ty in chain {
            for m in &ty.mixins {
                if !names.contains(&m.as_str()) {
                    names.push(m);
                }
            }
        }
        names
            .into_iter()
            .map(|n| {
                self.mixin_by_name(n)
                    .ok_or_else(|| LoamError::Schema(format!("Unknown mixin '{n}'")))
            })
            .collect()
    }

    /// The compiled attribute set of a type: the parent's effective set
    /// first, then attributes of mixins newly composed at this type, then
    /// the type's own. Name collisions reject rather than shadow.
    pub fn effective_attributes(&self, type_name: &str) -> Result<Vec<&Attribute>> {
        self.ancestors(type_name)?; // surfaces inheritance cycles first
        let mut out: Vec<&Attribute> = Vec::new();
        let mut seen: Vec<&str> = Vec::new();
        self.collect_attributes(type_name, &mut out, &mut seen)?;
        Ok(out)
    }

    fn collect_attributes<'s>(
        &'s self,
        type_name: &str,
        out: &mut Vec<&'s Attribute>,
        seen: &mut Vec<&'s str>,
    ) -> Result<()> {
        let t = self.type_or_err(type_name)?;
        if let Some(parent) = &t.parent {
            self.collect_attributes(parent, out, seen)?;
        }

        let mut push = |attr: &'s Attribute, seen: &mut Vec<&'s str>, out: &mut Vec<&'s Attribute>| {
            if seen.contains(&attr.name.as_str()) {
                return Err(LoamError::Schema(format!(
                    "Type '{}' composes duplicate attribute '{}'",
                    type_name, attr.name
                )));
            }
            seen.push(&attr.name);
            out.push(attr);
            Ok(())
        };

        // Mixins an ancestor already composed contributed their attributes
        // in the ancestor's frame.
        let inherited: Vec<&str> = match &t.parent {
            Some(parent) => self
                .effective_mixins(parent)?
                .iter()
                .map(|m| m.name.as_str())
                .collect(),
            None => Vec::new(),
        };
        let mut composed_here: Vec<&str> = Vec::new();
        for mixin_name in &t.mixins {
            if inherited.contains(&mixin_name.as_str())
                || composed_here.contains(&mixin_name.as_str())
            {
                continue;
            }
            composed_here.push(mixin_name);
            let mixin = self
                .mixin_by_name(mixin_name)
                .ok_or_else(|| LoamError::Schema(format!("Unknown mixin '{mixin_name}'")))?;
            for attr in &mixin.attributes {
                push(attr, seen, out)?;
            }
        }

        for attr in &t.attributes {
            push(attr, seen, out)?;
        }
        Ok(())
    }

    /// Find one attribute in a type's effective set.
    pub fn effective_attribute(&self, type_name: &str, attr: &str) -> Result<&Attribute> {
        self.effective_attributes(type_name)?
            .into_iter()
            .find(|a| a.name == attr)
            .ok_or_else(|| {
                LoamError::Schema(format!("Type '{type_name}' has no attribute '{attr}'"))
            })
    }

    /// Every unique constraint effective on a type (ancestors first).
    pub fn effective_unique_constraints(&self, type_name: &str) -> Result<Vec<(&Type, &UniqueConstraint)>> {
        let t = self.type_or_err(type_name)?;
        let mut chain = self.ancestors(type_name)?;
        chain.reverse();
        chain.push(t);
        Ok(chain
            .into_iter()
            .flat_map(|ty| ty.unique_constraints.iter().map(move |c| (ty, c)))
            .collect())
    }

    /// All non-abstract types that are `type_name` or inherit from it.
    /// Declaration order.
    pub fn concrete_subtypes(&self, type_name: &str) -> Result<Vec<&Type>> {
        self.type_or_err(type_name)?;
        Ok(self
            .types
            .iter()
            .filter(|t| !t.is_abstract && self.is_subtype_of(&t.name, type_name))
            .collect())
    }

    /// All non-abstract types composing the mixin, directly or through an
    /// ancestor. Declaration order.
    pub fn concrete_implementers(&self, mixin_name: &str) -> Result<Vec<&Type>> {
        self.mixin_by_name(mixin_name)
            .ok_or_else(|| LoamError::Schema(format!("Unknown mixin '{mixin_name}'")))?;
        let mut out = Vec::new();
        for t in self.types.iter().filter(|t| !t.is_abstract) {
            let mixins = self.effective_mixins(&t.name)?;
            if mixins.iter().any(|m| m.name == mixin_name) {
                out.push(t);
            }
        }
        Ok(out)
    }

    /// Concrete types a reference attribute can point at.
    pub fn reference_implementers(&self, kind: &AttributeKind) -> Result<Vec<&Type>> {
        match kind {
            AttributeKind::TypeRef { target } => self.concrete_subtypes(target),
            AttributeKind::MixinRef { target } => self.concrete_implementers(target),
            _ => Err(LoamError::Schema(
                "Attribute is not a reference".to_string(),
            )),
        }
    }

    /// Validate the schema before deployment: resolvable parents, mixins
    /// and reference targets; no duplicate composed attribute names; no
    /// reserved words as attribute names; inverse attributes pointing at
    /// real owning relations. Collects every offender before failing.
    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();

        for t in &self.types {
            if let Some(parent) = &t.parent {
                if self.type_by_name(parent).is_none() {
                    problems.push(format!("Type '{}': unknown parent '{parent}'", t.name));
                }
            }
            for m in &t.mixins {
                if self.mixin_by_name(m).is_none() {
                    problems.push(format!("Type '{}': unknown mixin '{m}'", t.name));
                }
            }
            if problems.is_empty() {
                if let Err(e) = self.effective_attributes(&t.name) {
                    problems.push(e.to_string());
                }
            }
            for c in &t.unique_constraints {
                for attr in &c.attributes {
                    match self.effective_attribute(&t.name, attr) {
                        Ok(a) if !a.is_persisted() => problems.push(format!(
                            "Constraint '{}' on type '{}': attribute '{attr}' is not persisted",
                            c.name, t.name
                        )),
                        Ok(_) => {}
                        Err(_) => problems.push(format!(
                            "Constraint '{}' on type '{}': unknown attribute '{attr}'",
                            c.name, t.name
                        )),
                    }
                }
            }
        }

        let holders: Vec<AttributeHolder<'_>> = self
            .types
            .iter()
            .map(AttributeHolder::Type)
            .chain(self.mixins.iter().map(AttributeHolder::Mixin))
            .collect();
        for holder in holders {
            for attr in holder.attributes() {
                if crate::nquery::is_reserved_word(&attr.name) {
                    problems.push(format!(
                        "'{}': attribute name '{}' is a reserved query keyword",
                        holder.name(),
                        attr.name
                    ));
                }
                match &attr.kind {
                    AttributeKind::TypeRef { target } => {
                        if self.type_by_name(target).is_none() {
                            problems.push(format!(
                                "'{}'.{}: unknown target type '{target}'",
                                holder.name(),
                                attr.name
                            ));
                        }
                    }
                    AttributeKind::MixinRef { target } => {
                        if self.mixin_by_name(target).is_none() {
                            problems.push(format!(
                                "'{}'.{}: unknown target mixin '{target}'",
                                holder.name(),
                                attr.name
                            ));
                        }
                    }
                    AttributeKind::Inverse {
                        referenced_type,
                        referencing_attribute,
                    } => {
                        match self.type_by_name(referenced_type) {
                            None => problems.push(format!(
                                "'{}'.{}: unknown inverse type '{referenced_type}'",
                                holder.name(),
                                attr.name
                            )),
                            Some(_) => {
                                let owning = self
                                    .effective_attribute(referenced_type, referencing_attribute);
                                match owning {
                                    Ok(a) if a.is_reference() => {}
                                    _ => problems.push(format!(
                                        "'{}'.{}: '{referenced_type}.{referencing_attribute}' is not an owning relation",
                                        holder.name(),
                                        attr.name
                                    )),
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(LoamError::Schema(format!(
                "Schema '{}' failed validation:\n  - {}",
                self.name,
                problems.join("\n  - ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new("sample", "org.sample")
            .with_mixin(
                Mixin::new("Mix")
                    .attribute(Attribute::new("mixValue", AttributeKind::String { length: None })),
            )
            .with_type(
                Type::new("Base")
                    .abstract_type()
                    .attribute(Attribute::new("baseValue", AttributeKind::String { length: None })),
            )
            .with_type(
                Type::new("Bar")
                    .parent("Base")
                    .mix_with("Mix")
                    .attribute(Attribute::new("barValue", AttributeKind::String { length: None })),
            )
            .with_type(
                Type::new("Baz")
                    .parent("Bar")
                    .attribute(Attribute::new("bazValue", AttributeKind::String { length: None })),
            )
            .with_type(
                Type::new("Foo")
                    .attribute(Attribute::new("value", AttributeKind::String { length: None }))
                    .attribute(Attribute::new(
                        "ref",
                        AttributeKind::TypeRef {
                            target: "Bar".into(),
                        },
                    )),
            )
    }

    #[test]
    fn effective_attributes_union_parent_and_mixins() {
        let schema = sample_schema();
        let names: Vec<&str> = schema
            .effective_attributes("Baz")
            .unwrap()
            .iter()
            .map(|a| a.name.as_str())
            .collect();
        assert_eq!(names, vec!["baseValue", "mixValue", "barValue", "bazValue"]);
    }

    #[test]
    fn effective_attributes_rejects_duplicates() {
        let mut schema = sample_schema();
        // Baz redeclares an attribute inherited from Bar.
        schema
            .types
            .iter_mut()
            .find(|t| t.name == "Baz")
            .unwrap()
            .attributes
            .push(Attribute::new("barValue", AttributeKind::Boolean));
        let err = schema.effective_attributes("Baz").unwrap_err();
        assert!(err.to_string().contains("duplicate attribute 'barValue'"));
    }

    #[test]
    fn concrete_subtypes_excludes_abstract() {
        let schema = sample_schema();
        let subs: Vec<&str> = schema
            .concrete_subtypes("Base")
            .unwrap()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(subs, vec!["Bar", "Baz"]);
    }

    #[test]
    fn concrete_implementers_follow_inheritance() {
        let schema = sample_schema();
        let impls: Vec<&str> = schema
            .concrete_implementers("Mix")
            .unwrap()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        // Baz composes Mix through its parent Bar.
        assert_eq!(impls, vec!["Bar", "Baz"]);
    }

    #[test]
    fn validate_flags_unknown_references() {
        let schema = Schema::new("bad", "org.bad").with_type(
            Type::new("A")
                .parent("Missing")
                .attribute(Attribute::new(
                    "r",
                    AttributeKind::TypeRef {
                        target: "Nowhere".into(),
                    },
                )),
        );
        let err = schema.validate().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("unknown parent 'Missing'"));
        assert!(text.contains("unknown target type 'Nowhere'"));
    }

    #[test]
    fn validate_rejects_reserved_attribute_names() {
        let schema = Schema::new("bad", "org.bad").with_type(
            Type::new("A").attribute(Attribute::new("limit", AttributeKind::Boolean)),
        );
        let err = schema.validate().unwrap_err();
        assert!(err.to_string().contains("reserved query keyword"));
    }

    #[test]
    fn validate_checks_inverse_targets() {
        let schema = sample_schema().with_type(Type::new("Holder").attribute(
            Attribute::new(
                "foos",
                AttributeKind::Inverse {
                    referenced_type: "Foo".into(),
                    referencing_attribute: "value".into(), // not a relation
                },
            )
            .virtual_attr(),
        ));
        let err = schema.validate().unwrap_err();
        assert!(err.to_string().contains("not an owning relation"));
    }

    #[test]
    fn inheritance_cycle_detected() {
        let schema = Schema::new("cyc", "org.cyc")
            .with_type(Type::new("A").parent("B"))
            .with_type(Type::new("B").parent("A"));
        let err = schema.ancestors("A").unwrap_err();
        assert!(err.to_string().contains("Inheritance cycle"));
    }
}
