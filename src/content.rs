//! Typed block payloads.
//!
//! Stored block content is JSON, but every consumer works with
//! [`BlockContent`], parsed once when a guide's blocks are saved. Parsing is
//! tolerant: a field holding the wrong primitive type is removed and
//! reported instead of failing the block, so a guest page never renders a
//! half-typed value.

use crate::db::models::BlockType;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ContentError {
    #[error("{block_type} content must be a JSON object")]
    NotAnObject { block_type: BlockType },
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hero {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuickInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_in: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_out: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_guests: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Amenity {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Amenities {
    pub items: Vec<Amenity>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MapInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HostPick {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub items: Vec<Place>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Notice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Photo {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Gallery {
    pub images: Vec<Photo>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum BlockContent {
    Hero(Hero),
    QuickInfo(QuickInfo),
    Amenities(Amenities),
    Map(MapInfo),
    HostPick(HostPick),
    Notice(Notice),
    Gallery(Gallery),
}

/// Parsed content plus the JSON paths of fields that were dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedContent {
    pub content: BlockContent,
    pub dropped: Vec<String>,
}

/// Pulls typed fields out of one JSON object, recording mistyped ones.
struct Fields<'a> {
    obj: &'a Map<String, Value>,
    prefix: String,
    dropped: &'a mut Vec<String>,
}

impl<'a> Fields<'a> {
    fn drop_field(&mut self, key: &str) {
        self.dropped.push(format!("{}{}", self.prefix, key));
    }

    fn string(&mut self, key: &str) -> Option<String> {
        match self.obj.get(key)? {
            Value::Null => None,
            Value::String(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            _ => {
                self.drop_field(key);
                None
            }
        }
    }

    fn integer(&mut self, key: &str) -> Option<i64> {
        match self.obj.get(key)? {
            Value::Null => None,
            Value::Number(n) if n.as_i64().is_some() => n.as_i64(),
            _ => {
                self.drop_field(key);
                None
            }
        }
    }

    fn float(&mut self, key: &str) -> Option<f64> {
        match self.obj.get(key)? {
            Value::Null => None,
            Value::Number(n) => n.as_f64(),
            _ => {
                self.drop_field(key);
                None
            }
        }
    }

    /// Objects of an array field; non-object entries are dropped.
    fn objects(&mut self, key: &str) -> Vec<(usize, &'a Map<String, Value>)> {
        let obj = self.obj;
        match obj.get(key) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    match item {
                        Value::Object(map) => out.push((i, map)),
                        _ => self.drop_field(&format!("{key}[{i}]")),
                    }
                }
                out
            }
            Some(_) => {
                self.drop_field(key);
                Vec::new()
            }
        }
    }

    fn nested(&mut self, key: &str, index: usize, obj: &'a Map<String, Value>) -> Fields<'_> {
        Fields {
            obj,
            prefix: format!("{}{}[{}].", self.prefix, key, index),
            dropped: &mut *self.dropped,
        }
    }
}

impl BlockContent {
    /// Parses a raw payload for `block_type`. Only a non-object payload is
    /// an error; every other problem drops the offending field.
    pub fn parse(block_type: BlockType, raw: &Value) -> Result<ParsedContent, ContentError> {
        let obj = raw
            .as_object()
            .ok_or(ContentError::NotAnObject { block_type })?;
        let mut dropped = Vec::new();
        let mut f = Fields {
            obj,
            prefix: String::new(),
            dropped: &mut dropped,
        };

        let content = match block_type {
            BlockType::Hero => BlockContent::Hero(Hero {
                title: f.string("title"),
                subtitle: f.string("subtitle"),
                image_url: f.string("imageUrl"),
            }),
            BlockType::QuickInfo => BlockContent::QuickInfo(QuickInfo {
                check_in: f.string("checkIn"),
                check_out: f.string("checkOut"),
                max_guests: f.integer("maxGuests"),
                wifi_name: f.string("wifiName"),
                wifi_password: f.string("wifiPassword"),
                parking: f.string("parking"),
                address: f.string("address"),
            }),
            BlockType::Amenities => {
                let mut items = Vec::new();
                for (i, item) in f.objects("items") {
                    let mut n = f.nested("items", i, item);
                    match n.string("name") {
                        Some(name) => items.push(Amenity {
                            name,
                            description: n.string("description"),
                        }),
                        None => f.drop_field(&format!("items[{i}]")),
                    }
                }
                BlockContent::Amenities(Amenities { items })
            }
            BlockType::Map => BlockContent::Map(MapInfo {
                address: f.string("address"),
                lat: f.float("lat"),
                lng: f.float("lng"),
                description: f.string("description"),
            }),
            BlockType::HostPick => {
                let title = f.string("title");
                let mut items = Vec::new();
                for (i, item) in f.objects("items") {
                    let mut n = f.nested("items", i, item);
                    match n.string("name") {
                        Some(name) => items.push(Place {
                            name,
                            category: n.string("category"),
                            description: n.string("description"),
                            distance: n.string("distance"),
                            url: n.string("url"),
                        }),
                        None => f.drop_field(&format!("items[{i}]")),
                    }
                }
                BlockContent::HostPick(HostPick { title, items })
            }
            BlockType::Notice => BlockContent::Notice(Notice {
                title: f.string("title"),
                body: f.string("body"),
            }),
            BlockType::Gallery => {
                let mut images = Vec::new();
                for (i, item) in f.objects("images") {
                    let mut n = f.nested("images", i, item);
                    match n.string("url") {
                        Some(url) => images.push(Photo {
                            url,
                            caption: n.string("caption"),
                        }),
                        None => f.drop_field(&format!("images[{i}]")),
                    }
                }
                BlockContent::Gallery(Gallery { images })
            }
        };

        Ok(ParsedContent { content, dropped })
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            BlockContent::Hero(_) => BlockType::Hero,
            BlockContent::QuickInfo(_) => BlockType::QuickInfo,
            BlockContent::Amenities(_) => BlockType::Amenities,
            BlockContent::Map(_) => BlockType::Map,
            BlockContent::HostPick(_) => BlockType::HostPick,
            BlockContent::Notice(_) => BlockType::Notice,
            BlockContent::Gallery(_) => BlockType::Gallery,
        }
    }

    /// Normalized JSON form that gets stored.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Plain text used as the block's retrieval chunk. `None` when the
    /// block carries nothing worth embedding.
    pub fn search_text(&self) -> Option<String> {
        let mut lines: Vec<String> = Vec::new();
        let mut push = |label: &str, value: &Option<String>| {
            if let Some(v) = value {
                lines.push(format!("{label}: {v}"));
            }
        };

        match self {
            BlockContent::Hero(h) => {
                push("숙소", &h.title);
                push("소개", &h.subtitle);
            }
            BlockContent::QuickInfo(q) => {
                push("체크인", &q.check_in);
                push("체크아웃", &q.check_out);
                push("최대 인원", &q.max_guests.map(|n| format!("{n}명")));
                push("와이파이", &q.wifi_name);
                push("와이파이 비밀번호", &q.wifi_password);
                push("주차", &q.parking);
                push("주소", &q.address);
            }
            BlockContent::Amenities(a) => {
                if !a.items.is_empty() {
                    let names: Vec<&str> = a.items.iter().map(|i| i.name.as_str()).collect();
                    lines.push(format!("편의시설: {}", names.join(", ")));
                }
                for item in &a.items {
                    if let Some(desc) = &item.description {
                        lines.push(format!("{}: {}", item.name, desc));
                    }
                }
            }
            BlockContent::Map(m) => {
                push("위치", &m.address);
                push("찾아오는 길", &m.description);
            }
            BlockContent::HostPick(p) => {
                push("호스트 추천", &p.title);
                for place in &p.items {
                    let mut line = place.name.clone();
                    if let Some(category) = &place.category {
                        line.push_str(&format!(" ({category})"));
                    }
                    if let Some(desc) = &place.description {
                        line.push_str(&format!(" - {desc}"));
                    }
                    if let Some(distance) = &place.distance {
                        line.push_str(&format!(", 거리 {distance}"));
                    }
                    lines.push(format!("추천 장소: {line}"));
                }
            }
            BlockContent::Notice(n) => {
                push("공지", &n.title);
                if let Some(body) = &n.body {
                    lines.push(body.clone());
                }
            }
            BlockContent::Gallery(g) => {
                for photo in &g.images {
                    push("사진", &photo.caption);
                }
            }
        }

        (!lines.is_empty()).then(|| lines.join("\n"))
    }
}
