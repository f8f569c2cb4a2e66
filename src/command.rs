//! The command adapter: maps decoded wire command documents (`find`, `insert`,
//! `aggregate`, `findAndModify`, index DDL, ...) onto the collection-level entry points,
//! producing replies whose shapes match the reference server.

use bson::{doc, Bson, Document};
use tracing::debug;

use crate::{
    bson_util,
    coll::options::{
        AggregateOptions, CountOptions, FindOneAndDeleteOptions, FindOneAndReplaceOptions,
        FindOneAndUpdateOptions, FindOptions, InsertManyOptions, ReplaceOptions, ReturnDocument,
        UpdateOptions,
    },
    bson_util::UpdateDocKind,
    cursor::Cursor,
    db::Database,
    error::{code, Error, ErrorKind, Result},
    index::IndexModel,
};

impl Database {
    /// Executes a command document, returning the success reply. Errors are returned as
    /// [`Error`]; use [`Database::run_command_reply`] for the wire-style error envelope.
    pub fn run_command(&self, command: Document) -> Result<Document> {
        let (name, target) = match command.iter().next() {
            Some((name, target)) => (name.clone(), target.clone()),
            None => return Err(Error::failed_to_parse("no such command: ''")),
        };
        debug!(command = %name, "runCommand");
        match name.as_str() {
            "find" => self.cmd_find(&command, &target),
            "aggregate" => self.cmd_aggregate(&command, &target),
            "getMore" => self.cmd_get_more(&command, &target),
            "killCursors" => self.cmd_kill_cursors(&command, &target),
            "insert" => self.cmd_insert(&command, &target),
            "update" => self.cmd_update(&command, &target),
            "delete" => self.cmd_delete(&command, &target),
            "findAndModify" | "findandmodify" => self.cmd_find_and_modify(&command, &target),
            "count" => self.cmd_count(&command, &target),
            "distinct" => self.cmd_distinct(&command, &target),
            "createIndexes" => self.cmd_create_indexes(&command, &target),
            "listIndexes" => self.cmd_list_indexes(&target),
            "dropIndexes" => self.cmd_drop_indexes(&command, &target),
            "drop" => self.cmd_drop(&target),
            "listCollections" => self.cmd_list_collections(),
            unknown => Err(Error::command(
                code::COMMAND_NOT_FOUND,
                format!("no such command: '{}'", unknown),
            )),
        }
    }

    /// Executes a command document, encoding failures into the standard error envelope
    /// (`{ok: 0, code, codeName, errmsg}`) instead of returning `Err`.
    pub fn run_command_reply(&self, command: Document) -> Document {
        match self.run_command(command) {
            Ok(reply) => reply,
            Err(error) => {
                let error_code = error.code().unwrap_or(code::INTERNAL_ERROR);
                doc! {
                    "ok": 0.0,
                    "errmsg": error.message().unwrap_or_else(|| error.to_string()),
                    "code": error_code,
                    "codeName": error
                        .code_name()
                        .map(String::from)
                        .unwrap_or_else(|| code::name(error_code)),
                }
            }
        }
    }

    fn target_collection(&self, target: &Bson) -> Result<crate::Collection> {
        match target.as_str() {
            Some(name) => Ok(self.collection(name)),
            None => Err(Error::failed_to_parse(
                "collection name has invalid type",
            )),
        }
    }

    fn cursor_reply(&self, ns: String, mut cursor: Cursor, batch_size: Option<usize>) -> Result<Document> {
        let limit = batch_size.unwrap_or(usize::MAX);
        let mut first_batch = Vec::new();
        while first_batch.len() < limit {
            match cursor.next() {
                Some(doc) => first_batch.push(Bson::Document(doc?)),
                None => break,
            }
        }
        let cursor_id = if cursor.is_exhausted() {
            0
        } else {
            self.register_cursor(cursor)
        };
        Ok(doc! {
            "cursor": {
                "firstBatch": first_batch,
                "id": cursor_id,
                "ns": ns,
            },
            "ok": 1.0,
        })
    }

    fn cmd_find(&self, command: &Document, target: &Bson) -> Result<Document> {
        let coll = self.target_collection(target)?;
        let filter = command.get_document("filter").cloned().unwrap_or_default();
        let options = FindOptions::builder()
            .projection(command.get_document("projection").ok().cloned())
            .sort(command.get_document("sort").ok().cloned())
            .skip(command.get("skip").and_then(bson_util::get_int).map(|s| s.max(0) as u64))
            .limit(command.get("limit").and_then(bson_util::get_int))
            .build();
        let batch_size = command
            .get("batchSize")
            .and_then(bson_util::get_int)
            .map(|b| b.max(0) as usize);
        let cursor = coll.find_with_options(filter, options)?;
        self.cursor_reply(coll.namespace(), cursor, batch_size)
    }

    fn cmd_aggregate(&self, command: &Document, target: &Bson) -> Result<Document> {
        let coll = self.target_collection(target)?;
        let pipeline = command
            .get_array("pipeline")
            .map_err(|_| Error::failed_to_parse("aggregate requires a 'pipeline' array"))?
            .iter()
            .map(|stage| {
                stage.as_document().cloned().ok_or_else(|| {
                    Error::failed_to_parse("pipeline stages must be documents")
                })
            })
            .collect::<Result<Vec<Document>>>()?;
        let cursor_options = command.get_document("cursor").cloned().unwrap_or_default();
        let batch_size = cursor_options
            .get("batchSize")
            .and_then(bson_util::get_int)
            .map(|b| b.max(0) as usize);
        let cursor = coll.aggregate_with_options(pipeline, AggregateOptions::default())?;
        self.cursor_reply(coll.namespace(), cursor, batch_size)
    }

    fn cmd_get_more(&self, command: &Document, target: &Bson) -> Result<Document> {
        let cursor_id = bson_util::get_int(target)
            .ok_or_else(|| Error::failed_to_parse("getMore requires a cursor id"))?;
        let coll_name = command
            .get_str("collection")
            .map_err(|_| Error::failed_to_parse("getMore requires a 'collection'"))?;
        let batch_size = command
            .get("batchSize")
            .and_then(bson_util::get_int)
            .map(|b| b.max(0) as usize);
        let (batch, next_id) = self.cursor_batch(cursor_id, batch_size)?;
        Ok(doc! {
            "cursor": {
                "nextBatch": batch.into_iter().map(Bson::Document).collect::<Vec<_>>(),
                "id": next_id,
                "ns": format!("{}.{}", self.name(), coll_name),
            },
            "ok": 1.0,
        })
    }

    fn cmd_kill_cursors(&self, command: &Document, _target: &Bson) -> Result<Document> {
        let ids = command.get_array("cursors").map_err(|_| {
            Error::failed_to_parse("killCursors requires a 'cursors' array")
        })?;
        let mut killed = Vec::new();
        let mut not_found = Vec::new();
        for id in ids {
            let Some(cursor_id) = bson_util::get_int(id) else {
                continue;
            };
            if self.kill_cursor(cursor_id) {
                killed.push(Bson::Int64(cursor_id));
            } else {
                not_found.push(Bson::Int64(cursor_id));
            }
        }
        Ok(doc! { "cursorsKilled": killed, "cursorsNotFound": not_found, "ok": 1.0 })
    }

    fn cmd_insert(&self, command: &Document, target: &Bson) -> Result<Document> {
        let coll = self.target_collection(target)?;
        let documents = command
            .get_array("documents")
            .map_err(|_| Error::failed_to_parse("insert requires a 'documents' array"))?
            .iter()
            .map(|entry| {
                entry
                    .as_document()
                    .cloned()
                    .ok_or_else(|| Error::failed_to_parse("documents entries must be documents"))
            })
            .collect::<Result<Vec<Document>>>()?;
        let ordered = command.get_bool("ordered").unwrap_or(true);
        let options = InsertManyOptions::builder().ordered(Some(ordered)).build();
        match coll.insert_many(documents, options) {
            Ok(result) => Ok(doc! { "n": result.inserted_ids.len() as i32, "ok": 1.0 }),
            Err(error) => match *error.kind {
                ErrorKind::BulkWrite(failure) => {
                    let write_errors: Vec<Bson> = failure
                        .write_errors
                        .iter()
                        .map(|write_error| {
                            Bson::Document(doc! {
                                "index": write_error.index as i32,
                                "code": write_error.code,
                                "errmsg": write_error.message.clone(),
                            })
                        })
                        .collect();
                    Ok(doc! {
                        "n": failure.inserted_ids.len() as i32,
                        "writeErrors": write_errors,
                        "ok": 1.0,
                    })
                }
                kind => Err(Error::new(kind)),
            },
        }
    }

    fn cmd_update(&self, command: &Document, target: &Bson) -> Result<Document> {
        let coll = self.target_collection(target)?;
        let updates = command
            .get_array("updates")
            .map_err(|_| Error::failed_to_parse("update requires an 'updates' array"))?;
        let ordered = command.get_bool("ordered").unwrap_or(true);
        let mut n: i64 = 0;
        let mut n_modified: i64 = 0;
        let mut upserted: Vec<Bson> = Vec::new();
        let mut write_errors: Vec<Bson> = Vec::new();
        for (position, entry) in updates.iter().enumerate() {
            let entry = entry
                .as_document()
                .ok_or_else(|| Error::failed_to_parse("updates entries must be documents"))?;
            let q = entry.get_document("q").cloned().unwrap_or_default();
            let u = entry
                .get_document("u")
                .cloned()
                .map_err(|_| Error::failed_to_parse("update entry requires a 'u' document"))?;
            let multi = entry.get_bool("multi").unwrap_or(false);
            let upsert = entry.get_bool("upsert").unwrap_or(false);
            let outcome = match bson_util::classify_update(&u)? {
                UpdateDocKind::Replacement => coll.replace_one(
                    q,
                    u,
                    ReplaceOptions::builder().upsert(Some(upsert)).build(),
                ),
                UpdateDocKind::Operators => {
                    let options = UpdateOptions::builder().upsert(Some(upsert)).build();
                    if multi {
                        coll.update_many(q, u, options)
                    } else {
                        coll.update_one(q, u, options)
                    }
                }
            };
            match outcome {
                Ok(result) => {
                    n += result.matched_count as i64;
                    n_modified += result.modified_count as i64;
                    if let Some(id) = result.upserted_id {
                        n += 1;
                        upserted.push(Bson::Document(doc! {
                            "index": position as i32,
                            "_id": id,
                        }));
                    }
                }
                Err(error) => {
                    write_errors.push(Bson::Document(doc! {
                        "index": position as i32,
                        "code": error.code().unwrap_or(code::INTERNAL_ERROR),
                        "errmsg": error.message().unwrap_or_else(|| error.to_string()),
                    }));
                    if ordered {
                        break;
                    }
                }
            }
        }
        let mut reply = doc! { "n": n, "nModified": n_modified };
        if !upserted.is_empty() {
            reply.insert("upserted", upserted);
        }
        if !write_errors.is_empty() {
            reply.insert("writeErrors", write_errors);
        }
        reply.insert("ok", 1.0);
        Ok(reply)
    }

    fn cmd_delete(&self, command: &Document, target: &Bson) -> Result<Document> {
        let coll = self.target_collection(target)?;
        let deletes = command
            .get_array("deletes")
            .map_err(|_| Error::failed_to_parse("delete requires a 'deletes' array"))?;
        let ordered = command.get_bool("ordered").unwrap_or(true);
        let mut n: i64 = 0;
        let mut write_errors: Vec<Bson> = Vec::new();
        for (position, entry) in deletes.iter().enumerate() {
            let entry = entry
                .as_document()
                .ok_or_else(|| Error::failed_to_parse("deletes entries must be documents"))?;
            let q = entry.get_document("q").cloned().unwrap_or_default();
            let limit = entry.get("limit").and_then(bson_util::get_int).unwrap_or(0);
            let outcome = if limit == 1 {
                coll.delete_one(q)
            } else {
                coll.delete_many(q)
            };
            match outcome {
                Ok(result) => n += result.deleted_count as i64,
                Err(error) => {
                    write_errors.push(Bson::Document(doc! {
                        "index": position as i32,
                        "code": error.code().unwrap_or(code::INTERNAL_ERROR),
                        "errmsg": error.message().unwrap_or_else(|| error.to_string()),
                    }));
                    if ordered {
                        break;
                    }
                }
            }
        }
        let mut reply = doc! { "n": n };
        if !write_errors.is_empty() {
            reply.insert("writeErrors", write_errors);
        }
        reply.insert("ok", 1.0);
        Ok(reply)
    }

    fn cmd_find_and_modify(&self, command: &Document, target: &Bson) -> Result<Document> {
        let coll = self.target_collection(target)?;
        let query = command.get_document("query").cloned().unwrap_or_default();
        let sort = command.get_document("sort").ok().cloned();
        let fields = command.get_document("fields").ok().cloned();
        let upsert = command.get_bool("upsert").unwrap_or(false);
        let return_new = command.get_bool("new").unwrap_or(false);
        let value = if command.get_bool("remove").unwrap_or(false) {
            coll.find_one_and_delete(
                query,
                FindOneAndDeleteOptions::builder()
                    .sort(sort)
                    .projection(fields)
                    .build(),
            )?
        } else {
            let update = command
                .get_document("update")
                .cloned()
                .map_err(|_| Error::failed_to_parse("findAndModify requires 'update' or 'remove'"))?;
            let return_document = if return_new {
                ReturnDocument::After
            } else {
                ReturnDocument::Before
            };
            match bson_util::classify_update(&update)? {
                UpdateDocKind::Replacement => coll.find_one_and_replace(
                    query,
                    update,
                    FindOneAndReplaceOptions::builder()
                        .sort(sort)
                        .projection(fields)
                        .upsert(Some(upsert))
                        .return_document(Some(return_document))
                        .build(),
                )?,
                UpdateDocKind::Operators => coll.find_one_and_update(
                    query,
                    update,
                    FindOneAndUpdateOptions::builder()
                        .sort(sort)
                        .projection(fields)
                        .upsert(Some(upsert))
                        .return_document(Some(return_document))
                        .build(),
                )?,
            }
        };
        Ok(doc! {
            "value": value.map(Bson::Document).unwrap_or(Bson::Null),
            "ok": 1.0,
        })
    }

    fn cmd_count(&self, command: &Document, target: &Bson) -> Result<Document> {
        let coll = self.target_collection(target)?;
        let query = command.get_document("query").cloned().unwrap_or_default();
        let options = CountOptions::builder()
            .skip(command.get("skip").and_then(bson_util::get_int).map(|s| s.max(0) as u64))
            .limit(
                command
                    .get("limit")
                    .and_then(bson_util::get_int)
                    .filter(|l| *l != 0)
                    .map(|l| l.unsigned_abs()),
            )
            .build();
        let n = coll.count_documents_with_options(query, options)?;
        Ok(doc! { "n": n as i64, "ok": 1.0 })
    }

    fn cmd_distinct(&self, command: &Document, target: &Bson) -> Result<Document> {
        let coll = self.target_collection(target)?;
        let key = command
            .get_str("key")
            .map_err(|_| Error::failed_to_parse("distinct requires a 'key' string"))?;
        let query = command.get_document("query").cloned().unwrap_or_default();
        let values = coll.distinct(key, query)?;
        Ok(doc! { "values": values, "ok": 1.0 })
    }

    fn cmd_create_indexes(&self, command: &Document, target: &Bson) -> Result<Document> {
        let coll = self.target_collection(target)?;
        let before = coll.list_index_specs().len() as i32;
        let index_docs = command
            .get_array("indexes")
            .map_err(|_| Error::failed_to_parse("createIndexes requires an 'indexes' array"))?;
        let mut models = Vec::with_capacity(index_docs.len());
        for entry in index_docs {
            let entry = entry
                .as_document()
                .ok_or_else(|| Error::failed_to_parse("indexes entries must be documents"))?;
            let model: IndexModel = bson::from_document(entry.clone())
                .map_err(|e| Error::failed_to_parse(format!("invalid index spec: {}", e)))?;
            models.push(model);
        }
        coll.create_indexes(models)?;
        let after = coll.list_index_specs().len() as i32;
        Ok(doc! {
            "numIndexesBefore": before,
            "numIndexesAfter": after,
            "ok": 1.0,
        })
    }

    fn cmd_list_indexes(&self, target: &Bson) -> Result<Document> {
        let coll = self.target_collection(target)?;
        let specs = coll.list_index_specs();
        Ok(doc! {
            "cursor": {
                "firstBatch": specs.into_iter().map(Bson::Document).collect::<Vec<_>>(),
                "id": 0_i64,
                "ns": format!("{}.$cmd.listIndexes.{}", self.name(), coll.name()),
            },
            "ok": 1.0,
        })
    }

    fn cmd_drop_indexes(&self, command: &Document, target: &Bson) -> Result<Document> {
        let coll = self.target_collection(target)?;
        let n_was = coll.list_index_specs().len() as i32;
        match command.get("index") {
            Some(Bson::String(name)) => coll.drop_index(name)?,
            Some(Bson::Document(keys)) => coll.drop_index_by_key(keys)?,
            _ => {
                return Err(Error::failed_to_parse(
                    "dropIndexes requires an 'index' name or key specification",
                ))
            }
        }
        Ok(doc! { "nIndexesWas": n_was, "ok": 1.0 })
    }

    fn cmd_drop(&self, target: &Bson) -> Result<Document> {
        let name = target
            .as_str()
            .ok_or_else(|| Error::failed_to_parse("collection name has invalid type"))?;
        self.drop_collection(name);
        Ok(doc! { "ns": format!("{}.{}", self.name(), name), "ok": 1.0 })
    }

    fn cmd_list_collections(&self) -> Result<Document> {
        let batch: Vec<Bson> = self
            .list_collection_names()
            .into_iter()
            .map(|name| {
                Bson::Document(doc! {
                    "name": name,
                    "type": "collection",
                    "options": {},
                    "info": { "readOnly": false },
                })
            })
            .collect();
        Ok(doc! {
            "cursor": {
                "firstBatch": batch,
                "id": 0_i64,
                "ns": format!("{}.$cmd.listCollections", self.name()),
            },
            "ok": 1.0,
        })
    }
}
