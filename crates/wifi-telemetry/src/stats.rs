use crate::{Field, FieldKind, TelemetryRecord};
use serde::Serialize;
use std::collections::BTreeMap;

/// Summary of one numeric field over the samples where it was present.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

/// Per-field summaries for one device's history. Fields never reported are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Statistics {
    fields: BTreeMap<Field, FieldStats>,
}

impl Statistics {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TelemetryRecord>) -> Self {
        let numeric: Vec<Field> = Field::ALL
            .into_iter()
            .filter(|f| f.kind() != FieldKind::Text)
            .collect();
        // (min, max, sum, count) per field
        let mut acc: BTreeMap<Field, (f64, f64, f64, usize)> = BTreeMap::new();
        for record in records {
            for &field in &numeric {
                let Some(v) = field.value(record).and_then(|v| v.as_f64()) else {
                    continue;
                };
                let e = acc.entry(field).or_insert((v, v, 0.0, 0));
                e.0 = e.0.min(v);
                e.1 = e.1.max(v);
                e.2 += v;
                e.3 += 1;
            }
        }
        let fields = acc
            .into_iter()
            .map(|(field, (min, max, sum, count))| {
                (
                    field,
                    FieldStats {
                        min,
                        max,
                        mean: sum / count as f64,
                        count,
                    },
                )
            })
            .collect();
        Self { fields }
    }

    pub fn get(&self, field: Field) -> Option<&FieldStats> {
        self.fields.get(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, &FieldStats)> {
        self.fields.iter().map(|(f, s)| (*f, s))
    }
}
