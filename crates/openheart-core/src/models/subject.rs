use serde::Serialize;

use super::FileRecord;

/// Records grouped by subject. Subjects keep the order they were first seen in and
/// records keep their input order within a subject.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubjectLookup {
    groups: Vec<(String, Vec<FileRecord>)>,
}

impl SubjectLookup {
    fn insert(&mut self, key: &str, record: FileRecord) {
        match self.groups.iter_mut().find(|(k, _)| k == key) {
            Some((_, records)) => records.push(record),
            None => self.groups.push((key.to_string(), vec![record])),
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, subject: &str) -> Option<&[FileRecord]> {
        self.groups
            .iter()
            .find(|(k, _)| k == subject)
            .map(|(_, records)| records.as_slice())
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[FileRecord])> {
        self.groups
            .iter()
            .map(|(k, records)| (k.as_str(), records.as_slice()))
    }

    pub fn record_count(&self) -> usize {
        self.groups.iter().map(|(_, records)| records.len()).sum()
    }
}

impl IntoIterator for SubjectLookup {
    type Item = (String, Vec<FileRecord>);
    type IntoIter = std::vec::IntoIter<(String, Vec<FileRecord>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.into_iter()
    }
}

/// Group records by their subject label as it appeared in the uploaded archive.
pub fn create_subject_file_lookup<I>(records: I) -> SubjectLookup
where
    I: IntoIterator<Item = FileRecord>,
{
    let mut lookup = SubjectLookup::default();
    for record in records {
        let key = record.subject.clone();
        lookup.insert(&key, record);
    }
    lookup
}

/// Group records by subject-unique label, i.e. one group per subject per upload batch.
/// This is the granularity remote subjects are created and accepted/rejected at.
pub fn group_by_subject_unique<I>(records: I) -> SubjectLookup
where
    I: IntoIterator<Item = FileRecord>,
{
    let mut lookup = SubjectLookup::default();
    for record in records {
        let key = record.subject_unique.clone();
        lookup.insert(&key, record);
    }
    lookup
}
